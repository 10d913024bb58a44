//! Session coordination
//!
//! A session drives one improvement cycle through
//! `Created → Assigning → Collecting → Resolving → Closed`, with `Aborted`
//! reachable from any open state:
//!
//! - **State machine** (`state_machine.rs`): legal transition guards and the
//!   transition log.
//! - **Coordinator** (`coordinator.rs`): task assignment over the message
//!   channel, fan-in under one shared deadline, resolution, and the
//!   persistence of decisions and outcomes.
//!
//! At most one session is open at a time. The [`ActiveSession`] value is the
//! single owner that may drive it; other contexts can only request an abort
//! through an [`AbortHandle`].

pub mod coordinator;
pub mod state_machine;

use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;
use crate::state::{SessionId, SessionStatus, StoreError};

pub use coordinator::{
    AbortHandle, ActiveSession, AssignmentSummary, CollectSummary, SessionCoordinator,
};
pub use state_machine::{IllegalTransition, SessionStateMachine};

/// Error type for session coordination
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    /// No eligible worker exists for the requested capabilities
    #[error("No eligible workers for capabilities: {0}")]
    CapacityExceeded(String),

    #[error("Session {0} is still open")]
    SessionAlreadyOpen(SessionId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("{0}")]
    InvalidTransition(#[from] IllegalTransition),

    #[error("Session is {actual}, expected {expected}")]
    InvalidState {
        expected: SessionStatus,
        actual: SessionStatus,
    },

    /// Retries exhausted; the session stays in its current state
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Persistence error: {0}")]
    Store(StoreError),

    #[error("Session {session_id} aborted: {reason}")]
    Aborted {
        session_id: SessionId,
        reason: String,
    },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// The Decision Record is stored; the session must be closed with `resolve`
    #[error("Session {0} has a persisted decision and can only close")]
    DecisionPersisted(SessionId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => CoordinatorError::PersistenceUnavailable(msg),
            other => CoordinatorError::Store(other),
        }
    }
}

/// Result type for session coordination
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shared collection deadline, measured from dispatch
    pub task_deadline_ms: u64,
    /// Record decisions as advisory only
    pub dry_run: bool,
    /// Refuse a session when any requested capability has no active worker,
    /// instead of only when none of them has one
    pub require_full_capacity: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            task_deadline_ms: 300_000,
            dry_run: false,
            require_full_capacity: false,
        }
    }
}

impl SessionConfig {
    pub fn task_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.task_deadline_ms)
    }
}

/// Running counters across sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_aborted: u64,
    pub tasks_dispatched: u64,
    pub tasks_unassigned: u64,
    pub tasks_timed_out: u64,
    pub proposals_received: u64,
    pub proposals_accepted: u64,
    pub proposals_rejected: u64,
    pub duplicate_submissions: u64,
    pub late_rejections: u64,
}

impl CoordinatorMetrics {
    /// Share of received proposals that were accepted
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposals_received == 0 {
            0.0
        } else {
            self.proposals_accepted as f64 / self.proposals_received as f64
        }
    }
}
