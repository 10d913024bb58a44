//! Event bus for session coordination
//!
//! Provides pub/sub notifications using Tokio broadcast channels. Publishing
//! never blocks and never fails for lack of subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::CoordinationEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus over a broadcast channel
pub struct EventBus {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a bus whose slow subscribers lag after `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers, returning how many received it
    pub fn publish(&self, event: CoordinationEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
                count
            }
            Err(_) => {
                debug!(event_type, "Event published (no receivers)");
                0
            }
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by session ID
    pub session_id: Option<String>,
    /// Filter by worker ID
    pub worker_id: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    ///
    /// Events that are not scoped to a session or worker pass the
    /// corresponding filter.
    pub fn matches(&self, event: &CoordinationEvent) -> bool {
        if let (Some(sid), Some(event_sid)) = (&self.session_id, event.session_id()) {
            if event_sid != sid {
                return false;
            }
        }

        if let (Some(wid), Some(event_wid)) = (&self.worker_id, event.worker_id()) {
            if event_wid != wid {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<CoordinationEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<CoordinationEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<CoordinationEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Capability;
    use chrono::Utc;

    fn dispatched(session: &str, worker: &str) -> CoordinationEvent {
        CoordinationEvent::TaskDispatched {
            session_id: session.to_string(),
            task_id: "t-1".to_string(),
            worker_id: worker.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        assert_eq!(bus.publish(dispatched("s-1", "w-1")), 1);

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "task_dispatched");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(dispatched("s-1", "w-1")), 0);
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .session("s-1")
            .types(vec!["task_dispatched", "decision_recorded"]);

        let registered = CoordinationEvent::WorkerRegistered {
            worker_id: "w-1".into(),
            capability: Capability::Code,
            generation: 0,
            timestamp: Utc::now(),
        };

        assert!(filter.matches(&dispatched("s-1", "w-1")));
        assert!(!filter.matches(&dispatched("s-2", "w-1")));
        assert!(!filter.matches(&registered));
        assert!(EventFilter::new().worker("w-1").matches(&registered));
        assert!(!EventFilter::new().worker("w-2").matches(&registered));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new().shared();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().worker("target"));

        let publisher = Arc::clone(&bus);
        tokio::spawn(async move {
            publisher.publish(dispatched("s-1", "other"));
            publisher.publish(dispatched("s-1", "target"));
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.worker_id(), Some("target"));
    }
}
