//! Evolution Engine
//!
//! One pass reads the outcome log, scores every active worker, asks the
//! policy which ones retire and what replaces them, and commits the whole
//! plan as a single `commit_evolution` batch. Only after the batch is
//! durable does the registry change, so a storage failure never leaves a
//! registered worker without its recorded decision. A failed plan is kept
//! and retried first on the next pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::policy::EvolutionPolicy;
use super::stats::WorkerStats;
use super::{EvolutionConfig, EvolutionError, EvolutionResult};
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::registry::WorkerRegistry;
use crate::retry::{with_retry, RetryPolicy};
use crate::state::{
    new_id, Capability, EvolutionBatch, EvolutionRecord, LineageRecord, Retirement,
    SharedPersistence, Worker, WorkerId, WorkerStatus,
};

/// Score changes smaller than this are not written back
const SCORE_EPSILON: f64 = 1e-9;

/// What one pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionReport {
    pub pass: u64,
    /// Whether this pass committed a plan left over from a failed pass
    pub retried_pending: bool,
    pub retiring: Vec<WorkerId>,
    pub archived: Vec<WorkerId>,
    pub spawned: Vec<WorkerId>,
    /// Replacements dropped by the population cap or the policy
    pub skipped_spawns: usize,
    pub score_updates: BTreeMap<WorkerId, f64>,
}

struct EngineState {
    passes: u64,
    pending: Option<(EvolutionBatch, usize)>,
}

/// Applies evolution passes to the worker population
pub struct EvolutionEngine {
    config: EvolutionConfig,
    retry: RetryPolicy,
    registry: Arc<WorkerRegistry>,
    store: SharedPersistence,
    events: SharedEventBus,
    policy: Arc<dyn EvolutionPolicy>,
    state: Mutex<EngineState>,
}

impl EvolutionEngine {
    pub fn new(
        config: EvolutionConfig,
        retry: RetryPolicy,
        registry: Arc<WorkerRegistry>,
        store: SharedPersistence,
        events: SharedEventBus,
        policy: Arc<dyn EvolutionPolicy>,
    ) -> Self {
        Self {
            config,
            retry,
            registry,
            store,
            events,
            policy,
            state: Mutex::new(EngineState {
                passes: 0,
                pending: None,
            }),
        }
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Whether a failed plan is waiting to be committed
    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.pending.is_some()
    }

    /// Current statistics for every active worker
    pub async fn worker_stats(&self) -> EvolutionResult<Vec<WorkerStats>> {
        let mut stats = Vec::new();
        for load in self.registry.snapshot()? {
            if !load.worker.is_active() {
                continue;
            }
            let outcomes = with_retry(&self.retry, "outcomes_for_worker", || {
                self.store.outcomes_for_worker(&load.worker.id)
            })
            .await?;
            stats.push(WorkerStats::from_outcomes(
                &load.worker,
                &outcomes,
                self.config.window,
                self.config.min_score,
            ));
        }
        Ok(stats)
    }

    /// Run one evolution pass
    ///
    /// Passes are serialized. If the commit fails the plan is kept and the
    /// error returned; the next call commits that same plan before planning
    /// anew.
    pub async fn run_pass(&self) -> EvolutionResult<EvolutionReport> {
        let mut state = self.state.lock().await;

        let (batch, skipped_spawns, retried_pending) = match state.pending.take() {
            Some((batch, skipped)) => {
                info!(pass = batch.record.pass, "Retrying pending evolution plan");
                (batch, skipped, true)
            }
            None => {
                state.passes += 1;
                let (batch, skipped) = self.plan(state.passes).await?;
                (batch, skipped, false)
            }
        };
        let pass = batch.record.pass;

        if batch.is_empty() {
            debug!(pass, "Evolution pass found nothing to change");
            return Ok(EvolutionReport {
                pass,
                retried_pending,
                skipped_spawns,
                ..EvolutionReport::default()
            });
        }

        let committed = with_retry(&self.retry, "commit_evolution", || {
            self.store.commit_evolution(&batch)
        })
        .await;
        if let Err(e) = committed {
            error!(pass, error = %e, "Evolution commit failed, plan kept for the next pass");
            state.pending = Some((batch, skipped_spawns));
            return Err(EvolutionError::CommitFailed(e));
        }

        let applied = self.registry.apply_evolution(&batch)?;

        // The committed records assumed each worker's load at planning time;
        // write back the status the registry actually settled on.
        for worker in applied.retiring.iter().chain(applied.archived.iter()) {
            let planned = batch.workers.iter().find(|w| w.id == worker.id);
            if planned.map(|w| w.status) != Some(worker.status) {
                if let Err(e) = with_retry(&self.retry, "save_worker", || {
                    self.store.save_worker(worker)
                })
                .await
                {
                    warn!(worker_id = %worker.id, error = %e, "Worker status not persisted");
                }
            }
        }

        let now = Utc::now();
        for worker in &applied.retiring {
            self.publish_retiring(worker);
        }
        for worker in &applied.archived {
            self.publish_retiring(worker);
            self.events.publish(CoordinationEvent::WorkerArchived {
                worker_id: worker.id.clone(),
                timestamp: now,
            });
        }
        for worker in &applied.spawned {
            info!(
                worker_id = %worker.id,
                parent_id = ?worker.parent_id,
                capability = %worker.capability,
                generation = worker.generation,
                "Worker spawned"
            );
            self.events.publish(CoordinationEvent::WorkerSpawned {
                worker_id: worker.id.clone(),
                parent_id: worker.parent_id.clone(),
                capability: worker.capability,
                generation: worker.generation,
                timestamp: now,
            });
        }

        let report = EvolutionReport {
            pass,
            retried_pending,
            retiring: applied.retiring.iter().map(|w| w.id.clone()).collect(),
            archived: applied.archived.iter().map(|w| w.id.clone()).collect(),
            spawned: applied.spawned.iter().map(|w| w.id.clone()).collect(),
            skipped_spawns,
            score_updates: batch.record.score_updates.clone(),
        };
        info!(
            pass,
            retiring = report.retiring.len(),
            archived = report.archived.len(),
            spawned = report.spawned.len(),
            skipped_spawns,
            "Evolution pass committed"
        );
        self.events.publish(CoordinationEvent::EvolutionCompleted {
            pass,
            retired: report.retiring.len() + report.archived.len(),
            spawned: report.spawned.len(),
            timestamp: now,
        });
        Ok(report)
    }

    fn publish_retiring(&self, worker: &Worker) {
        self.events.publish(CoordinationEvent::WorkerRetiring {
            worker_id: worker.id.clone(),
            reason: worker.retirement_reason.clone().unwrap_or_default(),
            timestamp: Utc::now(),
        });
    }

    /// Build the batch for one pass from the current registry and outcome log
    async fn plan(&self, pass: u64) -> EvolutionResult<(EvolutionBatch, usize)> {
        let loads = self.registry.snapshot()?;
        let mut active: HashMap<Capability, usize> = self.registry.active_counts()?;

        let mut retirements = Vec::new();
        let mut spawned = Vec::new();
        let mut score_updates = BTreeMap::new();
        let mut workers = Vec::new();
        let mut skipped_spawns = 0;
        let now = Utc::now();

        for load in loads.iter().filter(|l| l.worker.is_active()) {
            let worker = &load.worker;
            let outcomes = with_retry(&self.retry, "outcomes_for_worker", || {
                self.store.outcomes_for_worker(&worker.id)
            })
            .await?;
            let stats = WorkerStats::from_outcomes(
                worker,
                &outcomes,
                self.config.window,
                self.config.min_score,
            );
            let score = stats.rolling_score;
            let score_changed = (score - worker.score).abs() > SCORE_EPSILON;
            if score_changed {
                score_updates.insert(worker.id.clone(), score);
            }

            if !self.policy.should_retire(&stats) {
                if score_changed {
                    let mut updated = worker.clone();
                    updated.score = score;
                    workers.push(updated);
                }
                continue;
            }

            let reason = format!(
                "rolling score {score:.3} below {:.3} for {} sessions",
                self.config.retirement_threshold,
                stats.sessions_below(self.config.retirement_threshold)
            );
            info!(
                worker_id = %worker.id,
                score,
                sessions_observed = stats.sessions_observed,
                "Worker selected for retirement"
            );
            retirements.push(Retirement {
                worker_id: worker.id.clone(),
                reason: reason.clone(),
                final_score: score,
            });

            let mut retired = worker.clone();
            retired.score = score;
            retired.status = if load.in_flight == 0 {
                WorkerStatus::Archived
            } else {
                WorkerStatus::Retiring
            };
            retired.retired_at = Some(now);
            retired.retirement_reason = Some(reason);
            workers.push(retired);
            if let Some(count) = active.get_mut(&worker.capability) {
                *count = count.saturating_sub(1);
            }

            let Some(spec) = self.policy.spawn_worker(worker.capability, worker) else {
                debug!(worker_id = %worker.id, "Policy declined a replacement");
                skipped_spawns += 1;
                continue;
            };
            let population = active.entry(spec.capability).or_insert(0);
            if *population >= self.config.max_workers_per_capability {
                info!(
                    capability = %spec.capability,
                    cap = self.config.max_workers_per_capability,
                    "Population cap reached, replacement skipped"
                );
                skipped_spawns += 1;
                continue;
            }
            *population += 1;

            let child = Worker::descendant_of(worker, spec.capability).with_traits(spec.traits);
            spawned.push(LineageRecord::for_worker(&child));
            workers.push(child);
        }

        let batch = EvolutionBatch {
            record: EvolutionRecord {
                id: new_id(),
                pass,
                retirements,
                spawned,
                score_updates,
                created_at: now,
            },
            workers,
        };
        Ok((batch, skipped_spawns))
    }
}
