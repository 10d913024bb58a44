//! Worker Registry: the live worker population
//!
//! Owns every worker record, its in-flight task reservations and the
//! per-capability rotation cursor. Lookups, task selection and lifecycle
//! transitions all happen under one lock, so a task is never handed to a
//! worker that is concurrently leaving `active`.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::{Capability, EvolutionBatch, TaskId, Worker, WorkerId, WorkerStatus};

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker {worker_id} is {status}, not active")]
    NotActive {
        worker_id: WorkerId,
        status: WorkerStatus,
    },

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

struct Entry {
    worker: Worker,
    in_flight: BTreeSet<TaskId>,
}

impl Entry {
    /// Move to `Retiring`, or straight to `Archived` when idle
    fn retire(&mut self, reason: &str) -> WorkerStatus {
        self.worker.status = if self.in_flight.is_empty() {
            WorkerStatus::Archived
        } else {
            WorkerStatus::Retiring
        };
        self.worker.retired_at = Some(Utc::now());
        self.worker.retirement_reason = Some(reason.to_string());
        self.worker.status
    }
}

#[derive(Default)]
struct Inner {
    /// Registration order
    order: Vec<WorkerId>,
    entries: HashMap<WorkerId, Entry>,
    /// Next rotation slot per capability
    cursors: HashMap<Capability, usize>,
}

impl Inner {
    fn active_for(&self, capability: Capability) -> Vec<&Entry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.worker.capability == capability && e.worker.is_active())
            .collect()
    }

    fn entry_mut(&mut self, worker_id: &str) -> RegistryResult<&mut Entry> {
        self.entries
            .get_mut(worker_id)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker_id.to_string()))
    }
}

/// Point-in-time view of one worker's load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub worker: Worker,
    pub in_flight: usize,
}

/// What applying an evolution batch changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedEvolution {
    /// Left `active` but still finishing work
    pub retiring: Vec<Worker>,
    /// Archived immediately because they were idle
    pub archived: Vec<Worker>,
    pub spawned: Vec<Worker>,
    /// Entries that no longer applied (worker gone or already inactive)
    pub skipped: Vec<WorkerId>,
}

/// Registry of live workers
#[derive(Default)]
pub struct WorkerRegistry {
    inner: RwLock<Inner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RegistryResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| RegistryError::LockPoisoned)
    }

    fn write(&self) -> RegistryResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Add a worker at the end of the registration order
    pub fn register(&self, worker: Worker) -> RegistryResult<()> {
        let mut inner = self.write()?;
        if inner.entries.contains_key(&worker.id) {
            return Err(RegistryError::DuplicateWorker(worker.id));
        }
        info!(
            worker_id = %worker.id,
            capability = %worker.capability,
            generation = worker.generation,
            "Worker registered"
        );
        inner.order.push(worker.id.clone());
        inner.entries.insert(
            worker.id.clone(),
            Entry {
                worker,
                in_flight: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Remove a worker; no-op if it is already absent
    pub fn deregister(&self, worker_id: &str) -> RegistryResult<Option<Worker>> {
        let mut inner = self.write()?;
        let removed = inner.entries.remove(worker_id).map(|e| e.worker);
        if removed.is_some() {
            inner.order.retain(|id| id != worker_id);
            debug!(worker_id, "Worker deregistered");
        }
        Ok(removed)
    }

    pub fn get(&self, worker_id: &str) -> RegistryResult<Option<Worker>> {
        Ok(self.read()?.entries.get(worker_id).map(|e| e.worker.clone()))
    }

    /// Active workers with a capability, in registration order
    pub fn find_by_capability(&self, capability: Capability) -> RegistryResult<Vec<Worker>> {
        Ok(self
            .read()?
            .active_for(capability)
            .into_iter()
            .map(|e| e.worker.clone())
            .collect())
    }

    /// Every worker regardless of status, in registration order
    pub fn snapshot(&self) -> RegistryResult<Vec<WorkerLoad>> {
        let inner = self.read()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|e| WorkerLoad {
                worker: e.worker.clone(),
                in_flight: e.in_flight.len(),
            })
            .collect())
    }

    pub fn in_flight(&self, worker_id: &str) -> RegistryResult<usize> {
        let inner = self.read()?;
        inner
            .entries
            .get(worker_id)
            .map(|e| e.in_flight.len())
            .ok_or_else(|| RegistryError::WorkerNotFound(worker_id.to_string()))
    }

    /// Count of active workers per capability
    pub fn active_counts(&self) -> RegistryResult<HashMap<Capability, usize>> {
        let inner = self.read()?;
        let mut counts = HashMap::new();
        for entry in inner.entries.values().filter(|e| e.worker.is_active()) {
            *counts.entry(entry.worker.capability).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Pick an active worker for a task and reserve it, atomically
    ///
    /// Candidates are ranked by current task count, then by distance from
    /// the capability's rotation cursor, then by identifier. Returns `None`
    /// when no active worker has the capability.
    pub fn select_for_task(
        &self,
        capability: Capability,
        task_id: &str,
    ) -> RegistryResult<Option<Worker>> {
        let mut inner = self.write()?;

        let chosen = {
            let candidates = inner.active_for(capability);
            if candidates.is_empty() {
                return Ok(None);
            }
            let n = candidates.len();
            let cursor = inner.cursors.get(&capability).copied().unwrap_or(0) % n;

            candidates
                .iter()
                .enumerate()
                .min_by(|(ia, a), (ib, b)| {
                    let dist_a = (ia + n - cursor) % n;
                    let dist_b = (ib + n - cursor) % n;
                    a.in_flight
                        .len()
                        .cmp(&b.in_flight.len())
                        .then_with(|| dist_a.cmp(&dist_b))
                        .then_with(|| a.worker.id.cmp(&b.worker.id))
                })
                .map(|(pos, e)| (pos, n, e.worker.id.clone()))
        };

        let Some((pos, n, worker_id)) = chosen else {
            return Ok(None);
        };
        inner.cursors.insert(capability, (pos + 1) % n);

        let entry = inner.entry_mut(&worker_id)?;
        entry.in_flight.insert(task_id.to_string());
        debug!(
            worker_id = %worker_id,
            task_id,
            in_flight = entry.in_flight.len(),
            "Worker reserved for task"
        );
        Ok(Some(entry.worker.clone()))
    }

    /// Release a task reservation
    ///
    /// Returns the worker record when this release archived a retiring worker.
    pub fn complete_task(&self, worker_id: &str, task_id: &str) -> RegistryResult<Option<Worker>> {
        let mut inner = self.write()?;
        let Some(entry) = inner.entries.get_mut(worker_id) else {
            return Ok(None);
        };
        entry.in_flight.remove(task_id);

        if entry.worker.status == WorkerStatus::Retiring && entry.in_flight.is_empty() {
            entry.worker.status = WorkerStatus::Archived;
            info!(worker_id, "Retiring worker finished in-flight work, archived");
            return Ok(Some(entry.worker.clone()));
        }
        Ok(None)
    }

    /// Take a worker out of assignment rotation
    pub fn begin_retirement(&self, worker_id: &str, reason: &str) -> RegistryResult<Worker> {
        let mut inner = self.write()?;
        let entry = inner.entry_mut(worker_id)?;
        if !entry.worker.is_active() {
            return Err(RegistryError::NotActive {
                worker_id: worker_id.to_string(),
                status: entry.worker.status,
            });
        }
        let status = entry.retire(reason);
        info!(worker_id, %status, reason, "Worker retired from rotation");
        Ok(entry.worker.clone())
    }

    /// Apply a committed evolution batch in one critical section
    ///
    /// Entries that no longer apply are skipped rather than failing the
    /// whole batch, since the batch is already durable.
    pub fn apply_evolution(&self, batch: &EvolutionBatch) -> RegistryResult<AppliedEvolution> {
        let mut inner = self.write()?;
        let mut applied = AppliedEvolution::default();

        for (worker_id, score) in &batch.record.score_updates {
            match inner.entries.get_mut(worker_id) {
                Some(entry) if entry.worker.status != WorkerStatus::Archived => {
                    entry.worker.score = *score;
                }
                _ => applied.skipped.push(worker_id.clone()),
            }
        }

        for retirement in &batch.record.retirements {
            match inner.entries.get_mut(&retirement.worker_id) {
                Some(entry) if entry.worker.is_active() => {
                    entry.worker.score = retirement.final_score;
                    match entry.retire(&retirement.reason) {
                        WorkerStatus::Archived => applied.archived.push(entry.worker.clone()),
                        _ => applied.retiring.push(entry.worker.clone()),
                    }
                }
                _ => applied.skipped.push(retirement.worker_id.clone()),
            }
        }

        for lineage in &batch.record.spawned {
            let record = batch.workers.iter().find(|w| w.id == lineage.worker_id);
            match record {
                Some(worker) if !inner.entries.contains_key(&worker.id) => {
                    let mut worker = worker.clone();
                    worker.status = WorkerStatus::Active;
                    inner.order.push(worker.id.clone());
                    inner.entries.insert(
                        worker.id.clone(),
                        Entry {
                            worker: worker.clone(),
                            in_flight: BTreeSet::new(),
                        },
                    );
                    applied.spawned.push(worker);
                }
                _ => applied.skipped.push(lineage.worker_id.clone()),
            }
        }

        info!(
            retiring = applied.retiring.len(),
            archived = applied.archived.len(),
            spawned = applied.spawned.len(),
            skipped = applied.skipped.len(),
            "Evolution applied to registry"
        );
        Ok(applied)
    }
}
