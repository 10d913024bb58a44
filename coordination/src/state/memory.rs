//! In-memory persistence backend
//!
//! Used by tests and the simulation binary. All maps sit behind one lock so
//! `commit_evolution` is atomic.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::store::{Persistence, StoreError, StoreResult};
use super::types::*;

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    workers: HashMap<WorkerId, Worker>,
    proposals: HashMap<ProposalId, Proposal>,
    decisions: HashMap<SessionId, DecisionRecord>,
    outcomes: HashMap<(SessionId, WorkerId), Outcome>,
    lineage: HashMap<WorkerId, LineageRecord>,
    evolutions: Vec<EvolutionRecord>,
}

/// Persistence backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> StoreResult<T> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(&tables))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> StoreResult<T>) -> StoreResult<T> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut tables)
    }
}

fn not_found(kind: &str, id: &str) -> StoreError {
    StoreError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        self.write(|t| {
            t.sessions.insert(session.id.clone(), session.clone());
            Ok(())
        })
    }

    async fn load_session(&self, session_id: &str) -> StoreResult<Session> {
        self.read(|t| t.sessions.get(session_id).cloned())?
            .ok_or_else(|| not_found("session", session_id))
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self.read(|t| t.sessions.values().cloned().collect())?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn save_worker(&self, worker: &Worker) -> StoreResult<()> {
        self.write(|t| {
            t.workers.insert(worker.id.clone(), worker.clone());
            Ok(())
        })
    }

    async fn load_worker(&self, worker_id: &str) -> StoreResult<Worker> {
        self.read(|t| t.workers.get(worker_id).cloned())?
            .ok_or_else(|| not_found("worker", worker_id))
    }

    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        let mut workers: Vec<Worker> = self.read(|t| t.workers.values().cloned().collect())?;
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workers)
    }

    async fn save_proposal(&self, proposal: &Proposal) -> StoreResult<()> {
        self.write(|t| {
            t.proposals.insert(proposal.id.clone(), proposal.clone());
            Ok(())
        })
    }

    async fn load_proposal(&self, proposal_id: &str) -> StoreResult<Proposal> {
        self.read(|t| t.proposals.get(proposal_id).cloned())?
            .ok_or_else(|| not_found("proposal", proposal_id))
    }

    async fn proposals_for_session(&self, session_id: &str) -> StoreResult<Vec<Proposal>> {
        let mut proposals: Vec<Proposal> = self.read(|t| {
            t.proposals
                .values()
                .filter(|p| p.session_id == session_id)
                .cloned()
                .collect()
        })?;
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(proposals)
    }

    async fn save_decision(&self, decision: &DecisionRecord) -> StoreResult<()> {
        self.write(|t| match t.decisions.get(&decision.session_id) {
            Some(existing) if existing == decision => Ok(()),
            Some(_) => Err(StoreError::Conflict(format!(
                "decision for session {} already recorded",
                decision.session_id
            ))),
            None => {
                t.decisions
                    .insert(decision.session_id.clone(), decision.clone());
                Ok(())
            }
        })
    }

    async fn load_decision(&self, session_id: &str) -> StoreResult<DecisionRecord> {
        self.read(|t| t.decisions.get(session_id).cloned())?
            .ok_or_else(|| not_found("decision", session_id))
    }

    async fn save_outcome(&self, outcome: &Outcome) -> StoreResult<()> {
        self.write(|t| {
            let key = (outcome.session_id.clone(), outcome.worker_id.clone());
            t.outcomes.insert(key, outcome.clone());
            Ok(())
        })
    }

    async fn outcomes_for_session(&self, session_id: &str) -> StoreResult<Vec<Outcome>> {
        let mut outcomes: Vec<Outcome> = self.read(|t| {
            t.outcomes
                .values()
                .filter(|o| o.session_id == session_id)
                .cloned()
                .collect()
        })?;
        outcomes.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(outcomes)
    }

    async fn outcomes_for_worker(&self, worker_id: &str) -> StoreResult<Vec<Outcome>> {
        let mut outcomes: Vec<Outcome> = self.read(|t| {
            t.outcomes
                .values()
                .filter(|o| o.worker_id == worker_id)
                .cloned()
                .collect()
        })?;
        outcomes.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(outcomes)
    }

    async fn commit_evolution(&self, batch: &EvolutionBatch) -> StoreResult<()> {
        self.write(|t| {
            for worker in &batch.workers {
                t.workers.insert(worker.id.clone(), worker.clone());
            }
            for lineage in &batch.record.spawned {
                t.lineage.insert(lineage.worker_id.clone(), lineage.clone());
            }
            t.evolutions.push(batch.record.clone());
            Ok(())
        })
    }

    async fn load_lineage(&self, worker_id: &str) -> StoreResult<LineageRecord> {
        self.read(|t| t.lineage.get(worker_id).cloned())?
            .ok_or_else(|| not_found("lineage", worker_id))
    }

    async fn list_evolutions(&self) -> StoreResult<Vec<EvolutionRecord>> {
        self.read(|t| t.evolutions.clone())
    }
}
