//! Background evolution trigger
//!
//! Listens on the event bus and runs an evolution pass after every
//! `sessions_per_pass` recorded decisions. Passes never overlap a session's
//! resolution because they are driven by the decision event, and the
//! engine serializes them internally.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::EvolutionEngine;
use crate::events::{CoordinationEvent, EventBus};

/// Handle to the background evolution task
pub struct EvolutionScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl EvolutionScheduler {
    /// Start the scheduler task
    ///
    /// With `sessions_per_pass == 0` the task only waits for shutdown.
    pub fn spawn(engine: Arc<EvolutionEngine>, events: &EventBus, sessions_per_pass: u64) -> Self {
        let mut rx = events.subscribe();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut decisions = 0u64;
            let mut passes = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("Evolution scheduler shutdown signal received");
                        break;
                    }
                    received = rx.recv() => {
                        let before = decisions;
                        match received {
                            Ok(CoordinationEvent::DecisionRecorded { session_id, .. }) => {
                                decisions += 1;
                                debug!(%session_id, decisions, "Decision observed");
                            }
                            Ok(_) => continue,
                            // Skipped events are counted as decisions
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Evolution scheduler lagged behind the event bus");
                                decisions += n;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                        if !pass_due(before, decisions, sessions_per_pass) {
                            continue;
                        }
                        debug!(decisions, "Evolution pass due");
                        match engine.run_pass().await {
                            Ok(report) => {
                                passes += 1;
                                info!(
                                    pass = report.pass,
                                    spawned = report.spawned.len(),
                                    "Scheduled evolution pass finished"
                                );
                            }
                            Err(e) => warn!(error = %e, "Scheduled evolution pass failed"),
                        }
                    }
                }
            }
            passes
        });

        Self { shutdown, handle }
    }

    /// Stop the task and wait for it; returns the number of passes it ran
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.handle.await {
            Ok(passes) => passes,
            Err(e) => {
                warn!(error = %e, "Evolution scheduler task ended abnormally");
                0
            }
        }
    }
}

/// Whether the count crossed a multiple of `every`; one pass covers
/// several crossings after a lag
fn pass_due(before: u64, after: u64, every: u64) -> bool {
    every != 0 && after / every > before / every
}
