use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Broadcast capacity. Slow subscribers lag and drop, they never block
/// publishers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A lifecycle event with its publishing instance tag.
///
/// The `source` tag identifies the process instance that published the
/// event, so bridges replicating events between instances can drop echoes
/// of their own publications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEvent {
    /// Identifier of the publishing instance
    pub source: String,

    /// When the event was published
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub kind: ProxyEventKind,
}

/// Types of lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ProxyEventKind {
    /// A proxy reached Up
    ProxyStart {
        /// The started proxy
        proxy_id: String,
        /// Owning user, absent for pool-owned proxies
        user_id: Option<String>,
        /// The spec it was started from
        spec_id: String,
        /// Per-phase startup timings
        startup_log: StartupLog,
    },

    /// A proxy was stopped and its record removed
    ProxyStop {
        /// The stopped proxy
        proxy_id: String,
        /// Owning user
        user_id: Option<String>,
        /// The spec it was started from
        spec_id: String,
        /// Time spent Up; absent when the proxy never reached Up
        usage_duration: Option<Duration>,
    },

    /// A start attempt failed after reservation
    ProxyStartFailed {
        /// The failed proxy, when a record existed
        proxy_id: Option<String>,
        /// The requesting user
        user_id: Option<String>,
        /// The spec the start was for
        spec_id: String,
    },

    /// A proxy was paused
    ProxyPause {
        /// The paused proxy
        proxy_id: String,
        /// Owning user
        user_id: Option<String>,
        /// The spec it was started from
        spec_id: String,
    },

    /// A proxy was resumed
    ProxyResume {
        /// The resumed proxy
        proxy_id: String,
        /// Owning user
        user_id: Option<String>,
        /// The spec it was started from
        spec_id: String,
    },

    /// A user is waiting for a seat of a shared spec
    PendingProxy {
        /// The waiting proxy record
        proxy_id: String,
        /// The waiting user
        user_id: Option<String>,
        /// The shared spec
        spec_id: String,
    },

    /// A seat was claimed and left the unclaimed pool
    SeatClaimed {
        /// The shared spec
        spec_id: String,
        /// The claimed seat
        seat_id: Uuid,
        /// The delegate proxy owning the seat's containers
        delegate_proxy_id: String,
        /// The delegating proxy that claimed the seat
        claimant_proxy_id: String,
    },

    /// A seat entered (or re-entered) the unclaimed pool
    SeatAvailable {
        /// The shared spec
        spec_id: String,
        /// The available seat
        seat_id: Uuid,
    },
}

impl ProxyEventKind {
    /// The spec this event concerns
    #[must_use]
    pub fn spec_id(&self) -> &str {
        match self {
            Self::ProxyStart { spec_id, .. }
            | Self::ProxyStop { spec_id, .. }
            | Self::ProxyStartFailed { spec_id, .. }
            | Self::ProxyPause { spec_id, .. }
            | Self::ProxyResume { spec_id, .. }
            | Self::PendingProxy { spec_id, .. }
            | Self::SeatClaimed { spec_id, .. }
            | Self::SeatAvailable { spec_id, .. } => spec_id,
        }
    }
}

/// Per-phase timings accumulated while a proxy starts up
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StartupLog {
    /// Time spent in runtime-value injection and spec resolution
    pub prepare: Option<Duration>,

    /// Time spent in the backend start call
    pub container_start: Option<Duration>,

    /// Time spent waiting for the readiness probe
    pub probe: Option<Duration>,
}

/// In-process publish/subscribe for lifecycle events, backed by a broadcast
/// channel. Publishing never blocks; events published while no subscriber
/// listens are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    source: String,
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    /// Create a bus tagged with this instance's identifier
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source: source.into(),
            tx,
        }
    }

    /// The instance tag stamped on published events
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, kind: ProxyEventKind) {
        let event = ProxyEvent {
            source: self.source.clone(),
            timestamp: Utc::now(),
            kind,
        };
        tracing::debug!(source = %event.source, event = ?event.kind, "Publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}
