//! RocksDB-backed persistence
//!
//! Provides durable storage with column families for logical data separation.
//! Uses bincode for compact binary serialization internally. Evolution
//! commits go through a single `WriteBatch` so they land atomically.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};

use super::schema::{self, keys, ALL_CFS};
use super::store::{Persistence, StoreError, StoreResult};
use super::types::*;

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Shared reference to RocksStore
pub type SharedRocksStore = Arc<RocksStore>;

/// RocksDB-backed persistent store
pub struct RocksStore {
    db: RwLock<DB>,
    path: PathBuf,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    pub fn shared(self) -> SharedRocksStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let bytes = encode(value)?;
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Unavailable(format!("column family {cf_name} missing")))?;
        db.put_cf(cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Unavailable(format!("column family {cf_name} missing")))?;

        match db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<T> {
        self.get(cf_name, key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Decode every value whose key starts with `prefix`
    fn scan<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Unavailable(format!("column family {cf_name} missing")))?;

        let mut values = Vec::new();
        for result in db.prefix_iterator_cf(cf, prefix.as_bytes()) {
            let (key, value) = result?;
            if !key.starts_with(prefix.as_bytes()) {
                break; // Prefix no longer matches
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }
}

#[async_trait]
impl Persistence for RocksStore {
    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        self.put(schema::CF_SESSIONS, &keys::session(&session.id), session)
    }

    async fn load_session(&self, session_id: &str) -> StoreResult<Session> {
        self.require(schema::CF_SESSIONS, &keys::session(session_id))
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self.scan(schema::CF_SESSIONS, "sess:")?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn save_worker(&self, worker: &Worker) -> StoreResult<()> {
        self.put(schema::CF_WORKERS, &keys::worker(&worker.id), worker)
    }

    async fn load_worker(&self, worker_id: &str) -> StoreResult<Worker> {
        self.require(schema::CF_WORKERS, &keys::worker(worker_id))
    }

    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        let mut workers: Vec<Worker> = self.scan(schema::CF_WORKERS, "worker:")?;
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workers)
    }

    async fn save_proposal(&self, proposal: &Proposal) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let proposals = db
            .cf_handle(schema::CF_PROPOSALS)
            .ok_or_else(|| StoreError::Unavailable("column family proposals missing".into()))?;
        let index = db
            .cf_handle(schema::CF_PROPOSAL_INDEX)
            .ok_or_else(|| StoreError::Unavailable("column family proposal_index missing".into()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            proposals,
            keys::proposal(&proposal.session_id, &proposal.id),
            encode(proposal)?,
        );
        batch.put_cf(
            index,
            keys::proposal_index(&proposal.id),
            proposal.session_id.as_bytes(),
        );
        db.write(batch)?;
        Ok(())
    }

    async fn load_proposal(&self, proposal_id: &str) -> StoreResult<Proposal> {
        let session_id = {
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let index = db.cf_handle(schema::CF_PROPOSAL_INDEX).ok_or_else(|| {
                StoreError::Unavailable("column family proposal_index missing".into())
            })?;
            let bytes = db
                .get_cf(index, keys::proposal_index(proposal_id).as_bytes())?
                .ok_or_else(|| StoreError::NotFound(format!("proposal {proposal_id}")))?;
            String::from_utf8(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        self.require(
            schema::CF_PROPOSALS,
            &keys::proposal(&session_id, proposal_id),
        )
    }

    async fn proposals_for_session(&self, session_id: &str) -> StoreResult<Vec<Proposal>> {
        let mut proposals: Vec<Proposal> =
            self.scan(schema::CF_PROPOSALS, &keys::proposal_prefix(session_id))?;
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(proposals)
    }

    async fn save_decision(&self, decision: &DecisionRecord) -> StoreResult<()> {
        let key = keys::decision(&decision.session_id);
        // Writers are serialized by the session owner; check-then-put is enough here
        match self.get::<DecisionRecord>(schema::CF_DECISIONS, &key)? {
            Some(existing) if existing == *decision => Ok(()),
            Some(_) => Err(StoreError::Conflict(format!(
                "decision for session {} already recorded",
                decision.session_id
            ))),
            None => self.put(schema::CF_DECISIONS, &key, decision),
        }
    }

    async fn load_decision(&self, session_id: &str) -> StoreResult<DecisionRecord> {
        self.require(schema::CF_DECISIONS, &keys::decision(session_id))
    }

    async fn save_outcome(&self, outcome: &Outcome) -> StoreResult<()> {
        let key = keys::outcome(&outcome.session_id, &outcome.worker_id);
        self.put(schema::CF_OUTCOMES, &key, outcome)
    }

    async fn outcomes_for_session(&self, session_id: &str) -> StoreResult<Vec<Outcome>> {
        self.scan(schema::CF_OUTCOMES, &keys::outcome_prefix(session_id))
    }

    async fn outcomes_for_worker(&self, worker_id: &str) -> StoreResult<Vec<Outcome>> {
        let mut outcomes: Vec<Outcome> = self
            .scan::<Outcome>(schema::CF_OUTCOMES, "out:")?
            .into_iter()
            .filter(|o| o.worker_id == worker_id)
            .collect();
        outcomes.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(outcomes)
    }

    async fn commit_evolution(&self, batch: &EvolutionBatch) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = |name: &str| {
            db.cf_handle(name)
                .ok_or_else(|| StoreError::Unavailable(format!("column family {name} missing")))
        };
        let workers = cf(schema::CF_WORKERS)?;
        let lineage = cf(schema::CF_LINEAGE)?;
        let evolutions = cf(schema::CF_EVOLUTIONS)?;

        let mut write = WriteBatch::default();
        for worker in &batch.workers {
            write.put_cf(workers, keys::worker(&worker.id), encode(worker)?);
        }
        for record in &batch.record.spawned {
            write.put_cf(lineage, keys::lineage(&record.worker_id), encode(record)?);
        }
        write.put_cf(
            evolutions,
            keys::evolution(batch.record.pass, &batch.record.id),
            encode(&batch.record)?,
        );
        db.write(write)?;
        Ok(())
    }

    async fn load_lineage(&self, worker_id: &str) -> StoreResult<LineageRecord> {
        self.require(schema::CF_LINEAGE, &keys::lineage(worker_id))
    }

    async fn list_evolutions(&self) -> StoreResult<Vec<EvolutionRecord>> {
        self.scan(schema::CF_EVOLUTIONS, "evo:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let (store, _dir) = test_store();
        let session = Session::new(&[TaskSpec::new(Capability::Code, "src/main.rs")]);

        store.save_session(&session).await.unwrap();
        let loaded = store.load_session(&session.id).await.unwrap();
        assert_eq!(loaded, session);

        assert!(matches!(
            store.load_session("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_proposals_by_session_and_id() {
        let (store, _dir) = test_store();
        let resources: ResourceSet = ["a.py"].into_iter().collect();
        let p1 = Proposal::new("w-1", "s-1", "t-1", resources.clone(), b"diff".to_vec(), 0.8);
        let p2 = Proposal::new("w-2", "s-2", "t-2", resources, vec![], 0.4);

        store.save_proposal(&p1).await.unwrap();
        store.save_proposal(&p2).await.unwrap();

        let s1 = store.proposals_for_session("s-1").await.unwrap();
        assert_eq!(s1, vec![p1.clone()]);
        assert_eq!(store.load_proposal(&p2.id).await.unwrap(), p2);
    }

    #[tokio::test]
    async fn test_decision_write_once() {
        let (store, _dir) = test_store();
        let decision = DecisionRecord {
            session_id: "s-1".into(),
            accepted: vec![],
            rejected: vec![Rejection {
                proposal_id: "p-1".into(),
                worker_id: "w-1".into(),
                task_id: "t-1".into(),
                reason: RejectionReason::BelowThreshold {
                    confidence: 0.1,
                    floor: 0.5,
                },
            }],
            timed_out: vec![],
            unassigned: vec![],
            dry_run: false,
            decided_at: chrono::Utc::now(),
        };

        store.save_decision(&decision).await.unwrap();
        store.save_decision(&decision).await.unwrap();

        let mut other = decision.clone();
        other.dry_run = true;
        assert!(matches!(
            store.save_decision(&other).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.load_decision("s-1").await.unwrap(), decision);
    }

    #[tokio::test]
    async fn test_evolution_commit_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evo.db");
        let parent = Worker::new(Capability::Test);
        let child = Worker::descendant_of(&parent, Capability::Test);

        {
            let store = RocksStore::open(&path).unwrap();
            let batch = EvolutionBatch {
                record: EvolutionRecord {
                    id: new_id(),
                    pass: 1,
                    retirements: vec![],
                    spawned: vec![LineageRecord::for_worker(&child)],
                    score_updates: Default::default(),
                    created_at: chrono::Utc::now(),
                },
                workers: vec![child.clone()],
            };
            store.commit_evolution(&batch).await.unwrap();
        }

        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.load_worker(&child.id).await.unwrap(), child);
        assert_eq!(store.load_lineage(&child.id).await.unwrap().generation, 1);
        assert_eq!(store.list_evolutions().await.unwrap().len(), 1);
    }
}
