//! Message channel between the coordinator and its workers
//!
//! - **Messages** (`message.rs`): task assignments and cancellations wrapped
//!   in per-worker sequenced envelopes.
//! - **Transport** (`transport.rs`): bounded per-worker mailboxes with
//!   acknowledgement and redelivery, plus the shared submission queue
//!   workers answer on.
//!
//! Delivery to one worker is ordered; delivery across workers is not.
//! Delivery is at-least-once, so the coordinator deduplicates submissions by
//! task id.

pub mod message;
pub mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::WorkerId;

pub use message::{Envelope, TaskAssignment, WorkerMessage};
pub use transport::{MessageChannel, SharedMessageChannel, SubmissionReceiver, WorkerHandle};

/// Error type for channel operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Worker not connected: {0}")]
    NotConnected(WorkerId),

    #[error("Worker inbox full: {0}")]
    InboxFull(WorkerId),

    #[error("Worker disconnected: {0}")]
    Disconnected(WorkerId),

    #[error("Submission queue closed")]
    SubmissionsClosed,
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Mailbox sizing and send limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of each worker's inbox
    pub inbox_capacity: usize,
    /// Capacity of the shared worker-to-coordinator queue
    pub submission_capacity: usize,
    /// How long a send may wait for inbox capacity
    pub send_timeout_ms: u64,
}

impl ChannelConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 64,
            submission_capacity: 256,
            send_timeout_ms: 5_000,
        }
    }
}
