//! In-process message channel between the coordinator and workers
//!
//! Each worker owns a bounded mailbox. Envelopes sent to one worker are
//! observed in send order; every envelope stays in the worker's unacknowledged
//! buffer until the worker acks it, which gives at-least-once delivery across
//! reconnects. Workers reply through one shared submission queue.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, warn};

use super::message::{Envelope, WorkerMessage};
use super::{ChannelConfig, ChannelError, ChannelResult};
use crate::state::{Proposal, WorkerId};

/// Receiving end of the worker-to-coordinator submission queue
pub type SubmissionReceiver = mpsc::Receiver<Proposal>;

/// Shared reference to MessageChannel
pub type SharedMessageChannel = Arc<MessageChannel>;

struct Outbound {
    sender: mpsc::Sender<Envelope>,
    next_seq: u64,
}

struct Mailbox {
    worker_id: WorkerId,
    /// Held across sends so sequence order equals delivery order
    outbound: tokio::sync::Mutex<Outbound>,
    unacked: Mutex<BTreeMap<u64, Envelope>>,
    delivered: AtomicU64,
}

impl Mailbox {
    fn unacked(&self) -> MutexGuard<'_, BTreeMap<u64, Envelope>> {
        self.unacked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> Vec<Envelope> {
        self.unacked().values().cloned().collect()
    }
}

/// Addressable, ordered, at-least-once delivery to workers
pub struct MessageChannel {
    mailboxes: DashMap<WorkerId, Arc<Mailbox>>,
    submissions: mpsc::Sender<Proposal>,
    config: ChannelConfig,
}

impl MessageChannel {
    /// Create a channel and the receiver for worker submissions
    pub fn new(config: ChannelConfig) -> (Self, SubmissionReceiver) {
        let (submissions, receiver) = mpsc::channel(config.submission_capacity.max(1));
        let channel = Self {
            mailboxes: DashMap::new(),
            submissions,
            config,
        };
        (channel, receiver)
    }

    pub fn shared(self) -> SharedMessageChannel {
        Arc::new(self)
    }

    fn mailbox(&self, worker_id: &str) -> ChannelResult<Arc<Mailbox>> {
        self.mailboxes
            .get(worker_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ChannelError::NotConnected(worker_id.to_string()))
    }

    /// Open (or reopen) a worker's mailbox and return its handle
    ///
    /// On reconnect the previous inbox is closed and unacknowledged envelopes
    /// are redelivered, in order, as far as the new inbox has room.
    pub async fn connect(&self, worker_id: &str) -> WorkerHandle {
        let (sender, inbox) = mpsc::channel(self.config.inbox_capacity.max(1));

        let existing = self.mailboxes.get(worker_id).map(|e| Arc::clone(e.value()));
        let mailbox = match existing {
            Some(mailbox) => {
                let mut out = mailbox.outbound.lock().await;
                out.sender = sender;
                let mut redelivered = 0usize;
                for mut envelope in mailbox.pending() {
                    envelope.redelivered = true;
                    match out.sender.try_send(envelope) {
                        Ok(()) => redelivered += 1,
                        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => break,
                    }
                }
                debug!(worker_id, redelivered, "Worker reconnected");
                drop(out);
                mailbox
            }
            None => {
                let mailbox = Arc::new(Mailbox {
                    worker_id: worker_id.to_string(),
                    outbound: tokio::sync::Mutex::new(Outbound {
                        sender,
                        next_seq: 1,
                    }),
                    unacked: Mutex::new(BTreeMap::new()),
                    delivered: AtomicU64::new(0),
                });
                self.mailboxes
                    .insert(worker_id.to_string(), Arc::clone(&mailbox));
                debug!(worker_id, "Registered mailbox for worker");
                mailbox
            }
        };

        WorkerHandle {
            worker_id: worker_id.to_string(),
            inbox,
            mailbox,
            submissions: self.submissions.clone(),
        }
    }

    /// Remove a worker's mailbox; its handle observes end of stream
    pub async fn disconnect(&self, worker_id: &str) -> bool {
        let Some((_, mailbox)) = self.mailboxes.remove(worker_id) else {
            return false;
        };
        // Swapping in a dead sender drops the live one and closes the inbox
        let (closed, _) = mpsc::channel(1);
        mailbox.outbound.lock().await.sender = closed;
        debug!(worker_id, "Worker disconnected");
        true
    }

    pub fn is_connected(&self, worker_id: &str) -> bool {
        self.mailboxes.contains_key(worker_id)
    }

    /// Send a message to one worker, returning its sequence number
    ///
    /// Waits up to the configured send timeout for inbox capacity. A message
    /// that could not be handed over is not retained for redelivery.
    pub async fn publish(&self, worker_id: &str, message: WorkerMessage) -> ChannelResult<u64> {
        let mailbox = self.mailbox(worker_id)?;
        let mut out = mailbox.outbound.lock().await;

        let seq = out.next_seq;
        out.next_seq += 1;
        let envelope = Envelope {
            seq,
            worker_id: worker_id.to_string(),
            message,
            sent_at: Utc::now(),
            redelivered: false,
        };
        let kind = envelope.message.kind();
        mailbox.unacked().insert(seq, envelope.clone());

        match out
            .sender
            .send_timeout(envelope, self.config.send_timeout())
            .await
        {
            Ok(()) => {
                mailbox.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id, seq, kind, "Message delivered");
                Ok(seq)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                mailbox.unacked().remove(&seq);
                warn!(worker_id, seq, kind, "Worker inbox full");
                Err(ChannelError::InboxFull(worker_id.to_string()))
            }
            Err(SendTimeoutError::Closed(_)) => {
                mailbox.unacked().remove(&seq);
                warn!(worker_id, seq, kind, "Worker inbox closed");
                Err(ChannelError::Disconnected(worker_id.to_string()))
            }
        }
    }

    /// Send a message to every connected worker; returns how many accepted it
    pub async fn broadcast(&self, message: WorkerMessage) -> usize {
        let worker_ids: Vec<WorkerId> = self.mailboxes.iter().map(|e| e.key().clone()).collect();
        let mut delivered = 0;
        for worker_id in worker_ids {
            match self.publish(&worker_id, message.clone()).await {
                Ok(_) => delivered += 1,
                Err(e) => debug!(worker_id = %worker_id, error = %e, "Broadcast skipped worker"),
            }
        }
        delivered
    }

    /// Re-send every unacknowledged envelope to a worker, in sequence order
    pub async fn redeliver_unacked(&self, worker_id: &str) -> ChannelResult<usize> {
        let mailbox = self.mailbox(worker_id)?;
        let out = mailbox.outbound.lock().await;

        let mut count = 0;
        for mut envelope in mailbox.pending() {
            envelope.redelivered = true;
            match out
                .sender
                .send_timeout(envelope, self.config.send_timeout())
                .await
            {
                Ok(()) => count += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    return Err(ChannelError::InboxFull(worker_id.to_string()))
                }
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(ChannelError::Disconnected(worker_id.to_string()))
                }
            }
        }
        debug!(worker_id, count, "Redelivered unacknowledged messages");
        Ok(count)
    }

    /// Number of envelopes a worker has not acknowledged yet
    pub fn unacked_count(&self, worker_id: &str) -> usize {
        self.mailbox(worker_id)
            .map(|m| m.unacked().len())
            .unwrap_or(0)
    }

    /// Total envelopes handed to a worker's inbox, redeliveries excluded
    pub fn message_count(&self, worker_id: &str) -> u64 {
        self.mailbox(worker_id)
            .map(|m| m.delivered.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// A worker's end of the channel
pub struct WorkerHandle {
    worker_id: WorkerId,
    inbox: mpsc::Receiver<Envelope>,
    mailbox: Arc<Mailbox>,
    submissions: mpsc::Sender<Proposal>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Next envelope in send order; `None` once disconnected
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    /// Acknowledge an envelope so it is not redelivered
    pub fn ack(&self, seq: u64) -> bool {
        let removed = self.mailbox.unacked().remove(&seq).is_some();
        if removed {
            debug!(worker_id = %self.mailbox.worker_id, seq, "Message acknowledged");
        }
        removed
    }

    /// Send a proposal back to the coordinator
    pub async fn submit(&self, proposal: Proposal) -> ChannelResult<()> {
        self.submissions
            .send(proposal)
            .await
            .map_err(|_| ChannelError::SubmissionsClosed)
    }
}
