//! Evolution policy boundary
//!
//! The engine asks the policy two questions: should this worker retire, and
//! what should replace it. The policy never touches the registry or the
//! store; it only decides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::stats::WorkerStats;
use super::EvolutionConfig;
use crate::state::{Capability, Worker};

/// Configuration for a new worker, chosen by the policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub capability: Capability,
    /// Opaque settings carried on the new worker record
    #[serde(default)]
    pub traits: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            traits: BTreeMap::new(),
        }
    }
}

/// Decides retirements and replacements
pub trait EvolutionPolicy: Send + Sync {
    fn should_retire(&self, stats: &WorkerStats) -> bool;

    /// Replacement for a retired worker, or `None` to let the slot lapse
    fn spawn_worker(&self, capability: Capability, parent: &Worker) -> Option<WorkerSpec>;
}

/// Retire after `patience` consecutive sessions below a score threshold;
/// replace like for like, inheriting the parent's traits
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEvolutionPolicy {
    pub threshold: f64,
    pub patience: usize,
}

impl ThresholdEvolutionPolicy {
    pub fn new(threshold: f64, patience: usize) -> Self {
        Self {
            threshold,
            patience: patience.max(1),
        }
    }

    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self::new(config.retirement_threshold, config.window)
    }
}

impl EvolutionPolicy for ThresholdEvolutionPolicy {
    fn should_retire(&self, stats: &WorkerStats) -> bool {
        stats.rolling_score < self.threshold && stats.sessions_below(self.threshold) >= self.patience
    }

    fn spawn_worker(&self, capability: Capability, parent: &Worker) -> Option<WorkerSpec> {
        Some(WorkerSpec {
            capability,
            traits: parent.traits.clone(),
        })
    }
}
