//! # Event Bus System
//!
//! Provides the event channel of the track sync core using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enums for queue, transfer, worker and
//!   invalidation events
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   QueueEvent    ┌───────────┐
//! │ Sync Queue  ├────────────────>│           │
//! └─────────────┘                 │           │   subscribe   ┌──────────────┐
//! ┌─────────────┐   WorkerEvent   │ EventBus  ├──────────────>│ View cache   │
//! │ Worker Loop ├────────────────>│ (broadcast│               │ (reconcile)  │
//! └─────────────┘   Invalidation  │  channel) │               └──────────────┘
//! ┌─────────────┐                 │           │   subscribe   ┌──────────────┐
//! │ Poller      ├────────────────>│           ├──────────────>│ Host / UI    │
//! └─────────────┘                 └───────────┘               └──────────────┘
//! ```
//!
//! Every "something changed, refresh your view" signal travels as
//! [`CoreEvent::Invalidation`]. The poll timer, the worker and the
//! track-downloaded relay all publish on that one topic, so subscribers have a
//! single place to reconcile.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, InvalidationScope, InvalidationSource};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus.invalidate(InvalidationScope::All, InvalidationSource::Poll);
//!
//! let event = stream.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Invalidation(_)));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Subscribers that cache state should treat this as "invalidate everything".
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::RecvError;
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Sync queue mutations
    Queue(QueueEvent),
    /// Notifications from the transfer backend
    Transfer(TransferEvent),
    /// Worker loop lifecycle
    Worker(WorkerEvent),
    /// Cached views must be refreshed
    Invalidation(Invalidation),
}

// ============================================================================
// Queue Events
// ============================================================================

/// Events emitted when the sync queue changes.
///
/// `operation` is `"upload"` or `"download"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// New items were added.
    Enqueued {
        operation: String,
        folder_id: String,
        item_ids: Vec<String>,
        /// Track ids skipped because an equivalent item was already active.
        skipped_track_ids: Vec<String>,
    },
    /// An item was claimed by the worker.
    ItemStarted {
        item_id: String,
        track_id: String,
        operation: String,
    },
    /// A transfer finished successfully.
    ItemCompleted {
        item_id: String,
        track_id: String,
        operation: String,
    },
    /// A transfer failed.
    ItemFailed {
        item_id: String,
        track_id: String,
        operation: String,
        error: String,
        attempts: u32,
    },
    /// Items were cancelled.
    Cancelled { item_ids: Vec<String>, count: u64 },
    /// Failed items were put back to pending.
    Retried {
        folder_id: Option<String>,
        count: u64,
    },
    /// Terminal items were pruned.
    Cleared {
        /// `"completed"` or `"failed"`
        status: String,
        folder_id: Option<String>,
        count: u64,
    },
    /// Items left in progress by a previous run were reset.
    StaleReset { count: u64 },
}

// ============================================================================
// Transfer Events
// ============================================================================

/// Notifications about finished transfers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TransferEvent {
    /// A cloud track now has a local copy.
    TrackDownloaded {
        /// Track the download was requested for.
        track_id: String,
        /// Local library id of the new copy.
        local_track_id: Option<String>,
        cloud_track_id: String,
        sync_folder_id: String,
        /// Path relative to the folder's local root.
        relative_path: String,
    },
}

// ============================================================================
// Worker Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum WorkerEvent {
    /// The worker moved to a new state (`"running"`, `"paused"`, `"stopped"`).
    StateChanged { state: String },
}

// ============================================================================
// Invalidation
// ============================================================================

/// What a subscriber should drop from its caches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidationScope {
    /// Sync status of one track (cloud track id)
    TrackStatus { track_id: String },
    /// The merged local/cloud track list
    UnifiedTracks,
    /// Queue counters and item listings
    QueueStats,
    /// Everything
    All,
}

/// Who asked for the invalidation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationSource {
    Worker,
    TrackDownloaded,
    Poll,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Invalidation {
    pub scope: InvalidationScope,
    pub source: InvalidationSource,
}

impl Invalidation {
    pub fn new(scope: InvalidationScope, source: InvalidationSource) -> Self {
        Self { scope, source }
    }

    pub fn track(track_id: impl Into<String>, source: InvalidationSource) -> Self {
        Self::new(
            InvalidationScope::TrackStatus {
                track_id: track_id.into(),
            },
            source,
        )
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to core events.
///
/// Cloning the bus is cheap and every clone publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event, ignoring the "no subscribers" case.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    /// Shorthand for publishing an [`Invalidation`].
    pub fn invalidate(&self, scope: InvalidationScope, source: InvalidationSource) {
        self.publish(CoreEvent::Invalidation(Invalidation::new(scope, source)));
    }

    /// Creates a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A filtered stream of events.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only yield events matching `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that matches the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn downloaded(track_id: &str) -> CoreEvent {
        CoreEvent::Transfer(TransferEvent::TrackDownloaded {
            track_id: track_id.to_string(),
            local_track_id: Some(format!("local-{}", track_id)),
            cloud_track_id: track_id.to_string(),
            sync_folder_id: "folder-1".to_string(),
            relative_path: "Artist/Album/01.flac".to_string(),
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(10);
        bus.publish(downloaded("t1"));

        // Nothing is buffered for subscribers that arrive later
        let mut late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = CoreEvent::Queue(QueueEvent::ItemStarted {
            item_id: "item-1".to_string(),
            track_id: "track-1".to_string(),
            operation: "download".to_string(),
        });

        bus.publish(event.clone());
        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Invalidation(_)));

        bus.publish(downloaded("t1"));
        bus.invalidate(
            InvalidationScope::TrackStatus {
                track_id: "t1".to_string(),
            },
            InvalidationSource::TrackDownloaded,
        );

        let received = stream.recv().await.unwrap();
        assert_eq!(
            received,
            CoreEvent::Invalidation(Invalidation::track("t1", InvalidationSource::TrackDownloaded))
        );
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for _ in 0..5 {
            bus.invalidate(InvalidationScope::All, InvalidationSource::Poll);
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let handle1 = tokio::spawn(async move {
            for i in 0..10 {
                bus1.publish(CoreEvent::Invalidation(Invalidation::track(
                    format!("track-{}", i),
                    InvalidationSource::Worker,
                )));
            }
        });

        let handle2 = tokio::spawn(async move {
            for _ in 0..10 {
                bus2.invalidate(InvalidationScope::All, InvalidationSource::Poll);
            }
        });

        handle1.await.unwrap();
        handle2.await.unwrap();

        let mut count = 0;
        while let Ok(event) = sub.try_recv() {
            assert!(matches!(event, CoreEvent::Invalidation(_)));
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[tokio::test]
    async fn test_event_serialization() {
        let event = downloaded("t9");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "Transfer");
        assert_eq!(json["payload"]["event"], "TrackDownloaded");
        assert_eq!(json["payload"]["sync_folder_id"], "folder-1");

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_invalidation_scope_serialization() {
        let json = serde_json::to_value(Invalidation::track("t1", InvalidationSource::Poll)).unwrap();
        assert_eq!(json["scope"]["scope"], "track_status");
        assert_eq!(json["scope"]["track_id"], "t1");
        assert_eq!(json["source"], "poll");
    }

    #[tokio::test]
    async fn test_try_recv_empty_and_filtered() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|e| matches!(e, CoreEvent::Worker(_)));
        assert!(stream.try_recv().is_none());

        bus.publish(downloaded("t1"));
        assert!(stream.try_recv().is_none());

        bus.publish(CoreEvent::Worker(WorkerEvent::StateChanged {
            state: "paused".to_string(),
        }));
        assert!(matches!(
            stream.try_recv(),
            Some(Ok(CoreEvent::Worker(WorkerEvent::StateChanged { .. })))
        ));
    }
}
