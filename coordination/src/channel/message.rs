//! Messages carried from the coordinator to workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Capability, SessionId, TaskId, WorkerId};

/// Task dispatch payload
///
/// Redelivery carries the same task id, so a worker answering it twice
/// produces a duplicate the coordinator discards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub capability: Capability,
    /// Target resource path or scope
    pub scope: String,
    pub deadline: DateTime<Utc>,
}

/// Coordinator-to-worker message kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    AssignTask(TaskAssignment),
    /// Best-effort request to stop working on a task
    CancelTask {
        task_id: TaskId,
        session_id: SessionId,
        reason: String,
    },
}

impl WorkerMessage {
    pub fn task_id(&self) -> &str {
        match self {
            WorkerMessage::AssignTask(assignment) => &assignment.task_id,
            WorkerMessage::CancelTask { task_id, .. } => task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::AssignTask(_) => "assign_task",
            WorkerMessage::CancelTask { .. } => "cancel_task",
        }
    }
}

/// A sequenced message for one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-worker sequence number, strictly increasing in send order
    pub seq: u64,
    pub worker_id: WorkerId,
    pub message: WorkerMessage,
    pub sent_at: DateTime<Utc>,
    /// Set when this copy is a redelivery of an unacknowledged envelope
    pub redelivered: bool,
}
