//! Persistence for presence records and itinerary items.
//!
//! ```text
//! ┌──────────────────┐  upsert / mark_offline   ┌─────────────────────┐
//! │ PresenceSession  │ ───────────────────────► │ PresenceStore       │
//! └──────────────────┘   active_members(50)     │  MemoryStore        │
//!                                               │  RocksStore         │
//! ┌──────────────────┐  on_reorder              │   CF "presence"     │
//! │ ItineraryBoard   │ ─► TripItinerary ──────► │   CF "items"        │
//! └──────────────────┘  on_section_reorder      └─────────────────────┘
//! ```
//!
//! Both backends implement [`PresenceStore`] and [`ItemStore`];
//! [`TripItinerary`] adapts any [`ItemStore`] to the board's
//! [`ReorderPersistence`] seam for one trip.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use thiserror::Error;
use withme_core::itinerary::{apply_move, day_numbers, Bucket};
use withme_core::{ItemMove, ItineraryItem, PresenceRecord, ReorderError, ReorderPersistence};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for ReorderError {
    fn from(e: StoreError) -> Self {
        ReorderError::PersistFailed(e.to_string())
    }
}

/// Presence rows keyed by `(trip_id, user_id)`.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert the record, or replace the one stored for the same user and trip.
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    /// Mark the user offline on the trip, unless the stored record is
    /// newer than `as_of` (a later session has written since).
    /// Returns whether a row changed.
    async fn mark_offline(&self, trip_id: &str, user_id: &str, as_of: u64)
        -> Result<bool, StoreError>;

    /// Non-offline records for the trip, most recently active first.
    async fn active_members(&self, trip_id: &str, limit: usize)
        -> Result<Vec<PresenceRecord>, StoreError>;
}

/// Itinerary rows keyed by `(trip_id, item_id)`.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Every item of the trip, in no particular order.
    async fn load_items(&self, trip_id: &str) -> Result<Vec<ItineraryItem>, StoreError>;

    /// Write all `items` atomically.
    async fn put_items(&self, trip_id: &str, items: &[ItineraryItem]) -> Result<(), StoreError>;
}

/// Shared by both backends: mark a stored record offline if it is not newer.
pub(crate) fn apply_offline(record: &mut PresenceRecord, as_of: u64) -> bool {
    if record.last_active_at > as_of || record.status == withme_core::PresenceStatus::Offline {
        return false;
    }
    record.set_status(withme_core::PresenceStatus::Offline);
    record.cursor_position = None;
    record.last_active_at = as_of;
    true
}

/// Sort most recent first and cap.
pub(crate) fn most_recent(mut records: Vec<PresenceRecord>, limit: usize) -> Vec<PresenceRecord> {
    records.retain(PresenceRecord::is_active);
    records.sort_by(|a, b| {
        b.last_active_at
            .cmp(&a.last_active_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    records.truncate(limit);
    records
}

// ───────────────────────────────────────────────────────────────────
// Reorder persistence for one trip
// ───────────────────────────────────────────────────────────────────

/// [`ReorderPersistence`] for one trip on top of an [`ItemStore`].
///
/// A move is replayed on the stored list so neighbours shift the same
/// way they did on the board, then the whole trip is written back.
pub struct TripItinerary<'a, S: ItemStore + ?Sized> {
    store: &'a S,
    trip_id: String,
}

impl<'a, S: ItemStore + ?Sized> TripItinerary<'a, S> {
    pub fn new(store: &'a S, trip_id: impl Into<String>) -> Self {
        Self {
            store,
            trip_id: trip_id.into(),
        }
    }

    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    pub async fn load(&self) -> Result<Vec<ItineraryItem>, StoreError> {
        self.store.load_items(&self.trip_id).await
    }
}

#[async_trait]
impl<'a, S: ItemStore + ?Sized> ReorderPersistence for TripItinerary<'a, S> {
    async fn on_reorder(&self, item_move: &ItemMove) -> Result<(), ReorderError> {
        let mut items = self.load().await?;
        let target = Bucket::from_day(item_move.new_day_number);
        apply_move(&mut items, &item_move.item_id, target, item_move.new_position)
            .ok_or_else(|| ReorderError::UnknownItem(item_move.item_id.clone()))?;
        self.store.put_items(&self.trip_id, &items).await?;
        log::debug!(
            "Persisted move of {} to {target} position {} on trip {}",
            item_move.item_id,
            item_move.new_position,
            self.trip_id
        );
        Ok(())
    }

    async fn on_section_reorder(&self, day_order: &[i32]) -> Result<(), ReorderError> {
        let mut items = self.load().await?;
        let days = day_numbers(&items);
        let mut sorted = day_order.to_vec();
        sorted.sort_unstable();
        if sorted != days {
            let unknown = day_order
                .iter()
                .find(|d| !days.contains(d))
                .copied()
                .or_else(|| days.iter().find(|d| !day_order.contains(d)).copied())
                .unwrap_or_default();
            return Err(ReorderError::UnknownSection(Bucket::Day(unknown)));
        }

        // The bucket listed i-th takes the i-th smallest day number.
        for item in items.iter_mut() {
            if let Some(day) = item.day_number {
                if let Some(slot) = day_order.iter().position(|d| *d == day) {
                    item.day_number = Some(days[slot]);
                }
            }
        }
        self.store.put_items(&self.trip_id, &items).await?;
        log::debug!("Persisted day order {day_order:?} on trip {}", self.trip_id);
        Ok(())
    }
}
