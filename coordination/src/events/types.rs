//! Event types for session coordination
//!
//! These events are broadcast for observers such as the evolution scheduler.
//! They are notifications only; the durable record lives in the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{
    Capability, ProposalId, RejectionReason, SessionId, SessionStatus, TaskId, WorkerId,
};

/// All coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// A session was allocated
    SessionCreated {
        session_id: SessionId,
        task_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A session moved between states
    SessionTransitioned {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        timestamp: DateTime<Utc>,
    },

    /// A task was sent to a worker
    TaskDispatched {
        session_id: SessionId,
        task_id: TaskId,
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },

    /// No eligible worker could take a task
    TaskUnassigned {
        session_id: SessionId,
        task_id: TaskId,
        capability: Capability,
        timestamp: DateTime<Utc>,
    },

    /// A proposal was accepted into collection
    ProposalReceived {
        session_id: SessionId,
        task_id: TaskId,
        proposal_id: ProposalId,
        worker_id: WorkerId,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A task missed the shared deadline
    TaskTimedOut {
        session_id: SessionId,
        task_id: TaskId,
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },

    /// The decision record was persisted and the session closed
    DecisionRecorded {
        session_id: SessionId,
        accepted: usize,
        rejected: usize,
        timed_out: usize,
        timestamp: DateTime<Utc>,
    },

    /// A proposal arrived for an already decided session
    LateProposalRejected {
        session_id: SessionId,
        proposal_id: ProposalId,
        worker_id: WorkerId,
        reason: RejectionReason,
        timestamp: DateTime<Utc>,
    },

    /// A session was aborted without a decision
    SessionAborted {
        session_id: SessionId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    WorkerRegistered {
        worker_id: WorkerId,
        capability: Capability,
        generation: u32,
        timestamp: DateTime<Utc>,
    },

    WorkerRetiring {
        worker_id: WorkerId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    WorkerArchived {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },

    /// A replacement worker was spawned by evolution
    WorkerSpawned {
        worker_id: WorkerId,
        parent_id: Option<WorkerId>,
        capability: Capability,
        generation: u32,
        timestamp: DateTime<Utc>,
    },

    /// An evolution pass committed
    EvolutionCompleted {
        pass: u64,
        retired: usize,
        spawned: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionCreated { timestamp, .. }
            | Self::SessionTransitioned { timestamp, .. }
            | Self::TaskDispatched { timestamp, .. }
            | Self::TaskUnassigned { timestamp, .. }
            | Self::ProposalReceived { timestamp, .. }
            | Self::TaskTimedOut { timestamp, .. }
            | Self::DecisionRecorded { timestamp, .. }
            | Self::LateProposalRejected { timestamp, .. }
            | Self::SessionAborted { timestamp, .. }
            | Self::WorkerRegistered { timestamp, .. }
            | Self::WorkerRetiring { timestamp, .. }
            | Self::WorkerArchived { timestamp, .. }
            | Self::WorkerSpawned { timestamp, .. }
            | Self::EvolutionCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionTransitioned { .. } => "session_transitioned",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::TaskUnassigned { .. } => "task_unassigned",
            Self::ProposalReceived { .. } => "proposal_received",
            Self::TaskTimedOut { .. } => "task_timed_out",
            Self::DecisionRecorded { .. } => "decision_recorded",
            Self::LateProposalRejected { .. } => "late_proposal_rejected",
            Self::SessionAborted { .. } => "session_aborted",
            Self::WorkerRegistered { .. } => "worker_registered",
            Self::WorkerRetiring { .. } => "worker_retiring",
            Self::WorkerArchived { .. } => "worker_archived",
            Self::WorkerSpawned { .. } => "worker_spawned",
            Self::EvolutionCompleted { .. } => "evolution_completed",
        }
    }

    /// Get the session ID if this event is session-scoped
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionTransitioned { session_id, .. }
            | Self::TaskDispatched { session_id, .. }
            | Self::TaskUnassigned { session_id, .. }
            | Self::ProposalReceived { session_id, .. }
            | Self::TaskTimedOut { session_id, .. }
            | Self::DecisionRecorded { session_id, .. }
            | Self::LateProposalRejected { session_id, .. }
            | Self::SessionAborted { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Get the worker ID if this event concerns one worker
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::TaskDispatched { worker_id, .. }
            | Self::ProposalReceived { worker_id, .. }
            | Self::TaskTimedOut { worker_id, .. }
            | Self::LateProposalRejected { worker_id, .. }
            | Self::WorkerRegistered { worker_id, .. }
            | Self::WorkerRetiring { worker_id, .. }
            | Self::WorkerArchived { worker_id, .. }
            | Self::WorkerSpawned { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = CoordinationEvent::TaskDispatched {
            session_id: "s-1".into(),
            task_id: "t-1".into(),
            worker_id: "w-1".into(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"task_dispatched\""));

        let parsed: CoordinationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "task_dispatched");
        assert_eq!(parsed.session_id(), Some("s-1"));
        assert_eq!(parsed.worker_id(), Some("w-1"));
    }

    #[test]
    fn test_scoping_accessors() {
        let event = CoordinationEvent::EvolutionCompleted {
            pass: 2,
            retired: 1,
            spawned: 1,
            timestamp: Utc::now(),
        };
        assert_eq!(event.session_id(), None);
        assert_eq!(event.worker_id(), None);
    }
}
