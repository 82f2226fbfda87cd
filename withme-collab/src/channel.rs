//! Realtime channel abstraction.
//!
//! A [`Channel`] is one subscription to a topic (here: one trip) on a
//! realtime backend that tracks membership. Each connection may track
//! one [`PresenceRecord`] under its presence key; the backend keeps
//! every tracked record as a [`PresenceMeta`] and pushes full states and
//! join/leave diffs to every subscriber.
//!
//! [`ChannelCore`] is the client-side half shared by every transport:
//! handler registry, status callback and the local mirror of the
//! membership state.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use withme_core::PresenceRecord;

use crate::protocol::ProtocolError;

/// Channel-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("timed out waiting for the server")]
    TimedOut,
    #[error("channel closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ───────────────────────────────────────────────────────────────────
// Membership state
// ───────────────────────────────────────────────────────────────────

/// One tracked record, tagged with a ref unique to that `track` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub presence_ref: String,
    pub record: PresenceRecord,
}

/// Presence key (user id) → every meta tracked under it.
pub type PresenceSnapshot = BTreeMap<String, Vec<PresenceMeta>>;

/// Incremental membership change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    pub joins: PresenceSnapshot,
    pub leaves: PresenceSnapshot,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }

    /// The diff that turns `from` into `to`, compared by presence ref.
    pub fn between(from: &PresenceSnapshot, to: &PresenceSnapshot) -> Self {
        Self {
            joins: missing_metas(to, from),
            leaves: missing_metas(from, to),
        }
    }
}

/// Metas in `a` whose refs are absent from `b`, grouped by key.
fn missing_metas(a: &PresenceSnapshot, b: &PresenceSnapshot) -> PresenceSnapshot {
    let mut out = PresenceSnapshot::new();
    for (key, metas) in a {
        let known: HashSet<&str> = b
            .get(key)
            .map(|m| m.iter().map(|meta| meta.presence_ref.as_str()).collect())
            .unwrap_or_default();
        let missing: Vec<PresenceMeta> = metas
            .iter()
            .filter(|meta| !known.contains(meta.presence_ref.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            out.insert(key.clone(), missing);
        }
    }
    out
}

// ───────────────────────────────────────────────────────────────────
// Events and statuses
// ───────────────────────────────────────────────────────────────────

/// Event kinds a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Sync,
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The membership state changed; read it with [`Channel::presence_state`].
    Sync,
    Join {
        key: String,
        current: Vec<PresenceMeta>,
        new: Vec<PresenceMeta>,
    },
    Leave {
        key: String,
        current: Vec<PresenceMeta>,
        left: Vec<PresenceMeta>,
    },
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Sync => EventKind::Sync,
            ChannelEvent::Join { .. } => EventKind::Join,
            ChannelEvent::Leave { .. } => EventKind::Leave,
        }
    }

    /// Presence key of a join or leave.
    pub fn key(&self) -> Option<&str> {
        match self {
            ChannelEvent::Sync => None,
            ChannelEvent::Join { key, .. } | ChannelEvent::Leave { key, .. } => Some(key),
        }
    }
}

/// Values reported to the subscribe callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    /// The subscription was lost after it had been established.
    Closed,
}

impl fmt::Display for SubscribeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeStatus::Subscribed => f.write_str("subscribed"),
            SubscribeStatus::ChannelError(e) => write!(f, "channel error: {e}"),
            SubscribeStatus::TimedOut => f.write_str("timed out"),
            SubscribeStatus::Closed => f.write_str("closed"),
        }
    }
}

pub type EventHandler = Box<dyn Fn(&ChannelEvent) + Send + Sync>;
pub type EventFilter = Box<dyn Fn(&ChannelEvent) -> bool + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(SubscribeStatus) + Send + Sync>;

/// Wrap `handler` so it only sees events accepted by `filter`.
pub fn filtered(filter: EventFilter, handler: EventHandler) -> EventHandler {
    Box::new(move |event| {
        if filter(event) {
            handler(event);
        }
    })
}

/// Per-channel options.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Key under which this connection's record is tracked.
    pub presence_key: String,
    /// How long to wait for the join reply before reporting `TimedOut`.
    pub join_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(presence_key: impl Into<String>) -> Self {
        Self {
            presence_key: presence_key.into(),
            join_timeout: Duration::from_secs(10),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Traits
// ───────────────────────────────────────────────────────────────────

/// Opens channels on a realtime backend.
#[async_trait]
pub trait RealtimeClient: Send + Sync {
    async fn open_channel(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> Result<Arc<dyn Channel>, ChannelError>;
}

/// One subscription to a topic.
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Register `handler` for events of `kind`. Register before subscribing.
    fn on(&self, kind: EventKind, handler: EventHandler);

    /// Register `handler` for events of `kind` that also pass `filter`.
    fn on_matching(&self, kind: EventKind, filter: EventFilter, handler: EventHandler) {
        self.on(kind, filtered(filter, handler));
    }

    /// Start joining the topic. Returns at once; the outcome and any
    /// later loss of the subscription are reported through `on_status`.
    fn subscribe(&self, on_status: StatusCallback);

    /// Track (or replace) this connection's record.
    async fn track(&self, record: &PresenceRecord) -> Result<(), ChannelError>;

    async fn untrack(&self) -> Result<(), ChannelError>;

    /// The local mirror of the topic's membership.
    fn presence_state(&self) -> PresenceSnapshot;

    async fn unsubscribe(&self) -> Result<(), ChannelError>;
}

// ───────────────────────────────────────────────────────────────────
// Shared client-side machinery
// ───────────────────────────────────────────────────────────────────

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler registry and membership mirror behind every [`Channel`].
///
/// Handlers run on the thread that applies the update, after the mirror
/// lock is released. They must not register further handlers.
pub struct ChannelCore {
    topic: String,
    handlers: Mutex<Vec<(EventKind, EventHandler)>>,
    on_status: Mutex<Option<StatusCallback>>,
    state: Mutex<PresenceSnapshot>,
}

impl ChannelCore {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            handlers: Mutex::new(Vec::new()),
            on_status: Mutex::new(None),
            state: Mutex::new(PresenceSnapshot::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn register(&self, kind: EventKind, handler: EventHandler) {
        lock(&self.handlers).push((kind, handler));
    }

    pub fn set_status_callback(&self, on_status: StatusCallback) {
        *lock(&self.on_status) = Some(on_status);
    }

    /// Report a status to the subscriber, if one is registered.
    pub fn report(&self, status: SubscribeStatus) {
        log::debug!("Channel {} status: {status}", self.topic);
        if let Some(on_status) = lock(&self.on_status).as_ref() {
            on_status(status);
        }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        lock(&self.state).clone()
    }

    /// Replace the mirror with a full state from the backend.
    pub fn apply_state(&self, state: PresenceSnapshot) {
        let diff = PresenceDiff::between(&lock(&self.state), &state);
        self.apply_diff(diff);
    }

    /// Apply a diff, then dispatch joins, leaves and a final sync.
    pub fn apply_diff(&self, diff: PresenceDiff) {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);

            for (key, new) in diff.joins {
                let entry = state.entry(key.clone()).or_default();
                let current = entry.clone();
                let refs: HashSet<&str> = new.iter().map(|m| m.presence_ref.as_str()).collect();
                entry.retain(|m| !refs.contains(m.presence_ref.as_str()));
                entry.extend(new.iter().cloned());
                events.push(ChannelEvent::Join { key, current, new });
            }

            for (key, left) in diff.leaves {
                let Some(entry) = state.get_mut(&key) else {
                    continue;
                };
                let refs: HashSet<&str> = left.iter().map(|m| m.presence_ref.as_str()).collect();
                entry.retain(|m| !refs.contains(m.presence_ref.as_str()));
                let current = entry.clone();
                if current.is_empty() {
                    state.remove(&key);
                }
                events.push(ChannelEvent::Leave { key, current, left });
            }
        }
        events.push(ChannelEvent::Sync);

        let handlers = lock(&self.handlers);
        for event in &events {
            for (kind, handler) in handlers.iter() {
                if *kind == event.kind() {
                    handler(event);
                }
            }
        }
    }

    /// Forget the mirror and every registration.
    pub fn reset(&self) {
        lock(&self.state).clear();
        lock(&self.handlers).clear();
        *lock(&self.on_status) = None;
    }
}
