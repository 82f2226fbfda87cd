//! In-memory store for tests and the simulator.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use withme_core::{ItineraryItem, PresenceRecord};

use super::{apply_offline, most_recent, ItemStore, PresenceStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    /// trip_id -> user_id -> record
    presence: RwLock<HashMap<String, HashMap<String, PresenceRecord>>>,
    /// trip_id -> item_id -> item
    items: RwLock<HashMap<String, HashMap<String, ItineraryItem>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every item of the trip.
    pub async fn seed_items(&self, trip_id: &str, items: Vec<ItineraryItem>) {
        let rows = items.into_iter().map(|i| (i.id.clone(), i)).collect();
        self.items.write().await.insert(trip_id.to_string(), rows);
    }

    pub async fn presence_of(&self, trip_id: &str, user_id: &str) -> Option<PresenceRecord> {
        self.presence
            .read()
            .await
            .get(trip_id)
            .and_then(|users| users.get(user_id))
            .cloned()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        self.presence
            .write()
            .await
            .entry(record.trip_id.clone())
            .or_default()
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn mark_offline(
        &self,
        trip_id: &str,
        user_id: &str,
        as_of: u64,
    ) -> Result<bool, StoreError> {
        let mut presence = self.presence.write().await;
        Ok(presence
            .get_mut(trip_id)
            .and_then(|users| users.get_mut(user_id))
            .is_some_and(|record| apply_offline(record, as_of)))
    }

    async fn active_members(
        &self,
        trip_id: &str,
        limit: usize,
    ) -> Result<Vec<PresenceRecord>, StoreError> {
        let presence = self.presence.read().await;
        let records = presence
            .get(trip_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default();
        Ok(most_recent(records, limit))
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn load_items(&self, trip_id: &str) -> Result<Vec<ItineraryItem>, StoreError> {
        Ok(self
            .items
            .read()
            .await
            .get(trip_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_items(&self, trip_id: &str, items: &[ItineraryItem]) -> Result<(), StoreError> {
        let mut all = self.items.write().await;
        let rows = all.entry(trip_id.to_string()).or_default();
        for item in items {
            rows.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }
}
