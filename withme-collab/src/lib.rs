//! # withme-collab — Live trip presence for WithMe
//!
//! Tracks who is looking at a trip and keeps each user's own presence
//! published, over any realtime backend that implements [`RealtimeClient`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  Channel   ┌──────────────┐  WebSocket  ┌────────────────┐
//! │ PresenceSession │ ─────────► │ WsClient     │ ◄─────────► │ PresenceServer │
//! │ (per user)      │            │ LocalClient ─┼──────┐      └───────┬────────┘
//! └────────┬────────┘            └──────────────┘      ▼              ▼
//!          │                                   ┌─────────────┐ ┌─────────────┐
//!          │ upsert / mark_offline             │ PresenceHub │ │ PresenceHub │
//!          ▼                                   └─────────────┘ └─────────────┘
//! ┌─────────────────┐
//! │ PresenceStore   │  MemoryStore / RocksStore
//! └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`channel`] — Channel abstraction, membership snapshots and diffs
//! - [`hub`] — In-process topics with join/leave fan-out
//! - [`local`] — [`RealtimeClient`] over a shared hub
//! - [`protocol`] — Binary frames between client and server
//! - [`server`] — WebSocket presence server
//! - [`client`] — WebSocket [`RealtimeClient`]
//! - [`presence`] — The presence session manager
//! - [`storage`] — Presence and itinerary persistence

pub mod channel;
pub mod client;
pub mod hub;
pub mod local;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;

pub use channel::{
    filtered, Channel, ChannelConfig, ChannelError, ChannelEvent, EventFilter, EventKind,
    PresenceDiff, PresenceMeta, PresenceSnapshot, RealtimeClient, SubscribeStatus,
};
pub use client::WsClient;
pub use hub::{HubStats, PresenceHub};
pub use local::LocalClient;
pub use presence::{
    CleanupHandle, ConnectionState, DisabledPresence, Presence, PresenceApi, PresenceConfig,
    PresenceError, PresenceOptions, PresenceSession, PresenceView, RetryPolicy, SessionPhase,
};
pub use protocol::{ClientFrame, ProtocolError, ServerFrame};
pub use server::{PresenceServer, ServerConfig, ServerStats};
pub use storage::{
    ItemStore, MemoryStore, PresenceStore, RocksStore, StoreConfig, StoreError, TripItinerary,
};
