//! Worker population evolution
//!
//! Between sessions the engine scores workers from their recorded outcomes,
//! retires the persistently poor ones and spawns their replacements:
//!
//! - **Stats** (`stats.rs`): recency-weighted rolling scores.
//! - **Policy** (`policy.rs`): the retire/replace decision boundary.
//! - **Engine** (`engine.rs`): plans a pass and commits it atomically.
//! - **Scheduler** (`scheduler.rs`): runs a pass every N recorded decisions.
//!
//! A worker is never retired while its current session is unresolved: it
//! moves to `retiring` and is archived when its last task finishes.

pub mod engine;
pub mod policy;
pub mod scheduler;
pub mod stats;

use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;
use crate::state::StoreError;

pub use engine::{EvolutionEngine, EvolutionReport};
pub use policy::{EvolutionPolicy, ThresholdEvolutionPolicy, WorkerSpec};
pub use scheduler::EvolutionScheduler;
pub use stats::{outcome_score, rolling_score, WorkerStats};

/// Error type for evolution passes
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    /// The batch could not be made durable; nothing was applied
    #[error("Evolution commit failed, plan kept pending: {0}")]
    CommitFailed(StoreError),

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type EvolutionResult<T> = Result<T, EvolutionError>;

/// Evolution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Sessions in the rolling score, and consecutive sessions below the
    /// threshold before a worker retires
    pub window: usize,
    pub retirement_threshold: f64,
    /// Score given to a session with nothing accepted or a failed change
    pub min_score: f64,
    /// Active workers allowed per capability
    pub max_workers_per_capability: usize,
    /// Recorded decisions between scheduled passes (0 disables scheduling)
    pub sessions_per_pass: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            window: 5,
            retirement_threshold: 0.3,
            min_score: 0.0,
            max_workers_per_capability: 5,
            sessions_per_pass: 3,
        }
    }
}
