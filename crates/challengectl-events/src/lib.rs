// crates/challengectl-events/src/lib.rs
// ============================================================================
// Crate: challengectl-events
// Description: Fan-out event broadcaster.
// Purpose: Publish state-change notifications to N subscribers without ever
//          blocking a writer or holding a write lock while publishing.
// Dependencies: challengectl-core, tokio
// ============================================================================

//! ## Overview
//! A thin wrapper over [`tokio::sync::broadcast`]. Publish is fire-and-forget:
//! if there are no subscribers, the event is simply dropped; if a subscriber
//! is too slow to keep up, it misses events rather than blocking the
//! publisher (a `Lagged` receive error), matching the explicit "no
//! delivery guarantees." Callers MUST only call [`EventBus::publish`] after
//! their owning transaction has committed — this module performs no
//! buffering against that rule itself.

// ============================================================================
// SECTION: Imports
// ============================================================================

use challengectl_core::Event;
use challengectl_core::EventLog;
use tokio::sync::broadcast;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default bounded channel capacity. A lagging subscriber is dropped from
/// the fast path rather than allowed to grow this buffer unbounded.
pub const DEFAULT_CAPACITY: usize = 256;

// ============================================================================
// SECTION: EventBus
// ============================================================================

/// The concrete [`EventLog`] implementation used by the controller binary.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus with [`DEFAULT_CAPACITY`] buffered events per subscriber.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus with an explicit buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to future events. The returned receiver sees only events
    /// published after this call; callers that need current state should
    /// fetch a snapshot from the durable store before or immediately after
    /// subscribing (a one-shot initial state snapshot).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Returns the number of currently active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog for EventBus {
    fn publish(&self, event: Event) {
        // `send` returns an error only when there are zero subscribers;
        // that is an expected, non-fatal condition for a fire-and-forget bus.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use super::*;
    use challengectl_core::RunnerId;
    use challengectl_core::RunnerStatus;

    #[tokio::test]
    async fn subscriber_receives_events_published_after_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        bus.publish(Event::RunnerStatus { runner_id: RunnerId::new("r1"), status: RunnerStatus::Online });
        let received = receiver.recv().await.expect("event delivered");
        assert!(matches!(received, Event::RunnerStatus { status: RunnerStatus::Online, .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::RunnerStatus { runner_id: RunnerId::new("r1"), status: RunnerStatus::Offline });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_the_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Event::RunnerStatus { runner_id: RunnerId::new("r1"), status: RunnerStatus::Busy });
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[test]
    fn subscriber_count_tracks_active_receivers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _receiver = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
