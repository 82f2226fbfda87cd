//! # withme-core — Trip itinerary domain for WithMe
//!
//! Pure, synchronous-first building blocks shared by the presence layer
//! and the itinerary screen:
//!
//! ```text
//! ┌──────────────┐  drag events   ┌────────────────┐  ItemMove   ┌────────────────────┐
//! │ Itinerary UI │ ─────────────► │ ItineraryBoard │ ──────────► │ ReorderPersistence │
//! └──────────────┘                └───────┬────────┘             └────────────────────┘
//!                                         │ snapshot / rollback
//!                                         ▼
//!                                 ┌────────────────┐
//!                                 │LocalTransaction│
//!                                 └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Presence status and per-user presence records
//! - [`itinerary`] — Buckets, items and the position arithmetic of a move
//! - [`transaction`] — Snapshot/rollback for optimistic updates
//! - [`board`] — Drag-and-drop state machine over one trip's items

pub mod board;
pub mod itinerary;
pub mod model;
pub mod transaction;

pub use board::{DropOutcome, ItineraryBoard, PendingMove, ReorderError, ReorderPersistence};
pub use itinerary::{Bucket, DropTarget, ItemMove, ItineraryItem};
pub use model::{now_millis, CursorPosition, PresenceRecord, PresenceStatus};
pub use transaction::{apply_optimistic, LocalTransaction};
