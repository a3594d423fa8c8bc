//! Change broadcasting for real-time subscribers.
//!
//! The broadcaster fans committed `(collection, action, record)` events
//! out to subscriber sinks. Delivery is best-effort: each sink is a
//! bounded channel, and a sink that cannot accept more (backpressure) or
//! has gone away is closed and evicted. A periodic heartbeat writes a
//! keep-alive marker and evicts sinks that have been idle past the
//! timeout.
//!
//! The engine publishes through the [`ChangeSink`] trait rather than a
//! concrete broadcaster, so the realtime layer stays an injected
//! collaborator instead of a module cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use plinth_types::Record;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

/// Action carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Record created.
    Create,
    /// Record updated.
    Update,
    /// Record deleted.
    Delete,
}

impl ChangeAction {
    /// Static label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

/// A committed change, already sanitized for external eyes.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// Collection the record belongs to.
    pub collection: String,
    /// What happened.
    pub action: ChangeAction,
    /// The sanitized record (post-image; pre-image for deletes).
    pub data: Record,
}

/// Event sink injected into the engine. Implementations must not block:
/// the engine publishes on a deferred tick off the write return path.
pub trait ChangeSink: Send + Sync {
    /// Accepts one committed change.
    fn publish(&self, event: ChangeEvent);
}

/// Message delivered to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Connection marker, written once at subscribe time.
    Connected,
    /// Keep-alive marker from the heartbeat task.
    Ping,
    /// A change event, serialized once per broadcast.
    Event(Arc<str>),
}

/// Broadcaster configuration.
#[derive(Debug, Clone, bon::Builder)]
pub struct BroadcasterConfig {
    /// Heartbeat period.
    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,
    /// Idle age past which a sink is evicted.
    #[builder(default = Duration::from_secs(60))]
    pub idle_timeout: Duration,
    /// Bounded capacity of each subscriber channel.
    #[builder(default = 64)]
    pub sink_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            sink_capacity: 64,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<FeedMessage>,
    last_activity: Instant,
}

/// Fans committed change events out to subscriber sinks.
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    config: BroadcasterConfig,
}

impl Broadcaster {
    /// Creates a broadcaster with the given configuration.
    pub fn new(config: BroadcasterConfig) -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), config }
    }

    /// Registers a new sink and writes its connection marker.
    ///
    /// Returns the sink id and the receiving half the transport drains.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<FeedMessage>) {
        let (tx, rx) = mpsc::channel(self.config.sink_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Capacity is at least 1, so the marker always fits.
        let _ = tx.try_send(FeedMessage::Connected);
        self.subscribers.lock().push(Subscriber { id, tx, last_activity: Instant::now() });
        debug!(sink_id = id, "realtime sink subscribed");
        (id, rx)
    }

    /// Removes a sink (transport hung up).
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Serializes `event` once and writes it to every sink. Sinks that
    /// refuse the write (full queue or closed) are evicted.
    pub fn broadcast(&self, event: &ChangeEvent) {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(error) => {
                warn!(%error, collection = %event.collection, "dropping unserializable event");
                return;
            },
        };

        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain_mut(|sink| {
            match sink.tx.try_send(FeedMessage::Event(Arc::clone(&payload))) {
                Ok(()) => {
                    sink.last_activity = Instant::now();
                    true
                },
                Err(_) => {
                    debug!(sink_id = sink.id, "evicting unresponsive realtime sink");
                    false
                },
            }
        });
        let evicted = before - subscribers.len();
        if evicted > 0 {
            info!(evicted, "evicted realtime sinks on broadcast");
        }
    }

    /// Number of live sinks.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Runs the heartbeat loop: pings every sink each period and evicts
    /// sinks idle past the timeout. Spawn once as a background task.
    #[instrument(skip(self), name = "broadcaster_heartbeat")]
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.heartbeat_once();
        }
    }

    /// One heartbeat pass; factored out for tests.
    pub fn heartbeat_once(&self) {
        let idle_timeout = self.config.idle_timeout;
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain_mut(|sink| {
            if sink.last_activity.elapsed() > idle_timeout {
                debug!(sink_id = sink.id, "evicting idle realtime sink");
                return false;
            }
            match sink.tx.try_send(FeedMessage::Ping) {
                Ok(()) => {
                    sink.last_activity = Instant::now();
                    true
                },
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                // Full queue: keep the sink, the idle timeout decides.
                Err(mpsc::error::TrySendError::Full(_)) => true,
            }
        });
        let evicted = before - subscribers.len();
        if evicted > 0 {
            info!(evicted, remaining = subscribers.len(), "heartbeat evicted sinks");
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl ChangeSink for Broadcaster {
    fn publish(&self, event: ChangeEvent) {
        self.broadcast(&event);
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
