//! Persistence gateway
//!
//! The coordination core only needs save/load/query operations keyed by
//! identifiers. Every call distinguishes a retryable `Unavailable` condition
//! from a definitive `NotFound`, so callers can decide whether to back off.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::*;

/// Error type for persistence operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Transient failure; the call may succeed if retried
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// A write-once record already exists with different content
    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether retrying the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a persistence backend
pub type SharedPersistence = Arc<dyn Persistence>;

/// Durable storage for sessions, workers, proposals, decisions and outcomes
#[async_trait]
pub trait Persistence: Send + Sync {
    // Sessions
    async fn save_session(&self, session: &Session) -> StoreResult<()>;
    async fn load_session(&self, session_id: &str) -> StoreResult<Session>;
    /// All sessions, newest first
    async fn list_sessions(&self) -> StoreResult<Vec<Session>>;

    // Workers
    async fn save_worker(&self, worker: &Worker) -> StoreResult<()>;
    async fn load_worker(&self, worker_id: &str) -> StoreResult<Worker>;
    async fn list_workers(&self) -> StoreResult<Vec<Worker>>;

    // Proposals
    async fn save_proposal(&self, proposal: &Proposal) -> StoreResult<()>;
    async fn load_proposal(&self, proposal_id: &str) -> StoreResult<Proposal>;
    async fn proposals_for_session(&self, session_id: &str) -> StoreResult<Vec<Proposal>>;

    /// Write-once: an identical record is accepted again, a different one
    /// for the same session fails with `Conflict`
    async fn save_decision(&self, decision: &DecisionRecord) -> StoreResult<()>;
    async fn load_decision(&self, session_id: &str) -> StoreResult<DecisionRecord>;

    // Outcomes, keyed by (session, worker)
    async fn save_outcome(&self, outcome: &Outcome) -> StoreResult<()>;
    async fn outcomes_for_session(&self, session_id: &str) -> StoreResult<Vec<Outcome>>;
    /// Outcomes for one worker, oldest first
    async fn outcomes_for_worker(&self, worker_id: &str) -> StoreResult<Vec<Outcome>>;

    /// Persist every write of an evolution pass atomically
    async fn commit_evolution(&self, batch: &EvolutionBatch) -> StoreResult<()>;
    async fn load_lineage(&self, worker_id: &str) -> StoreResult<LineageRecord>;
    async fn list_evolutions(&self) -> StoreResult<Vec<EvolutionRecord>>;
}
