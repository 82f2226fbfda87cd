//! In-process presence backend: topics, tracked metas and diff fan-out.
//!
//! Every topic gets its own [`PresenceRoom`]. A room remembers which
//! connections joined it and the meta each one currently tracks, and
//! fans every change out to all subscribers as a [`PresenceDiff`] over
//! a tokio broadcast channel. A connection that leaves, cleanly or by
//! dropping its socket, is untracked and its meta goes out as a leave,
//! so stale members disappear from everyone's state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use withme_core::PresenceRecord;

use crate::channel::{ChannelError, PresenceDiff, PresenceMeta, PresenceSnapshot};

/// Hub-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub diffs_sent: u64,
    pub active_topics: usize,
    pub active_connections: usize,
}

struct Member {
    key: String,
    meta: Option<PresenceMeta>,
}

#[derive(Default)]
struct RoomState {
    members: HashMap<Uuid, Member>,
}

impl RoomState {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        for member in self.members.values() {
            if let Some(meta) = &member.meta {
                snapshot.entry(member.key.clone()).or_default().push(meta.clone());
            }
        }
        snapshot
    }
}

/// Membership of one topic.
pub struct PresenceRoom {
    sender: broadcast::Sender<Arc<PresenceDiff>>,
    state: RwLock<RoomState>,
    max_members: usize,
    diffs_sent: AtomicU64,
}

impl PresenceRoom {
    pub fn new(capacity: usize, max_members: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            state: RwLock::new(RoomState::default()),
            max_members,
            diffs_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection. Returns its diff receiver and the current
    /// state; diffs sent after the snapshot are guaranteed to arrive.
    pub async fn join(
        &self,
        conn_id: Uuid,
        key: &str,
    ) -> Result<(broadcast::Receiver<Arc<PresenceDiff>>, PresenceSnapshot), ChannelError> {
        let mut state = self.state.write().await;
        if !state.members.contains_key(&conn_id) && state.members.len() >= self.max_members {
            return Err(ChannelError::SubscribeFailed(format!(
                "topic is full ({} members)",
                self.max_members
            )));
        }
        state.members.entry(conn_id).or_insert_with(|| Member {
            key: key.to_string(),
            meta: None,
        });
        let rx = self.sender.subscribe();
        Ok((rx, state.snapshot()))
    }

    /// Track `record` for `conn_id`, replacing what it tracked before.
    pub async fn track(&self, conn_id: Uuid, record: PresenceRecord) -> Result<(), ChannelError> {
        let mut state = self.state.write().await;
        let member = state.members.get_mut(&conn_id).ok_or(ChannelError::Closed)?;

        let meta = PresenceMeta {
            presence_ref: Uuid::new_v4().to_string(),
            record,
        };
        let mut diff = PresenceDiff::default();
        diff.joins.insert(member.key.clone(), vec![meta.clone()]);
        if let Some(old) = member.meta.replace(meta) {
            diff.leaves.insert(member.key.clone(), vec![old]);
        }
        self.fan_out(diff);
        Ok(())
    }

    /// Drop the meta tracked by `conn_id`. Returns whether there was one.
    pub async fn untrack(&self, conn_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        let Some(member) = state.members.get_mut(&conn_id) else {
            return false;
        };
        let Some(old) = member.meta.take() else {
            return false;
        };
        let mut diff = PresenceDiff::default();
        diff.leaves.insert(member.key.clone(), vec![old]);
        self.fan_out(diff);
        true
    }

    /// Untrack and forget `conn_id`.
    pub async fn leave(&self, conn_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        let Some(member) = state.members.remove(&conn_id) else {
            return false;
        };
        if let Some(old) = member.meta {
            let mut diff = PresenceDiff::default();
            diff.leaves.insert(member.key, vec![old]);
            self.fan_out(diff);
        }
        true
    }

    pub async fn snapshot(&self) -> PresenceSnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len()
    }

    pub fn diffs_sent(&self) -> u64 {
        self.diffs_sent.load(Ordering::Relaxed)
    }

    /// Called with the state write lock held so diffs go out in state order.
    fn fan_out(&self, diff: PresenceDiff) {
        let receivers = self.sender.send(Arc::new(diff)).unwrap_or(0);
        self.diffs_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("Presence diff fanned out to {receivers} subscribers");
    }
}

/// Topic name → room.
pub struct PresenceHub {
    rooms: RwLock<HashMap<String, Arc<PresenceRoom>>>,
    capacity: usize,
    max_members: usize,
    diffs_sent_closed_rooms: AtomicU64,
}

impl PresenceHub {
    /// `capacity` is the per-subscriber diff buffer; `max_members` caps
    /// connections per topic.
    pub fn new(capacity: usize, max_members: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_members,
            diffs_sent_closed_rooms: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(256, 100)
    }

    pub async fn get_or_create(&self, topic: &str) -> Arc<PresenceRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            return room.clone();
        }
        let room = Arc::new(PresenceRoom::new(self.capacity, self.max_members));
        rooms.insert(topic.to_string(), room.clone());
        log::debug!("Presence room {topic} created");
        room
    }

    pub async fn room(&self, topic: &str) -> Option<Arc<PresenceRoom>> {
        self.rooms.read().await.get(topic).cloned()
    }

    pub async fn join(
        &self,
        topic: &str,
        conn_id: Uuid,
        key: &str,
    ) -> Result<(broadcast::Receiver<Arc<PresenceDiff>>, PresenceSnapshot), ChannelError> {
        loop {
            let room = self.get_or_create(topic).await;
            let joined = room.join(conn_id, key).await;
            if joined.is_err() {
                self.remove_if_empty(topic).await;
                return joined;
            }
            // The room may have been dropped as empty between lookup and join.
            match self.room(topic).await {
                Some(current) if Arc::ptr_eq(&current, &room) => return joined,
                _ => {
                    room.leave(conn_id).await;
                }
            }
        }
    }

    pub async fn track(
        &self,
        topic: &str,
        conn_id: Uuid,
        record: PresenceRecord,
    ) -> Result<(), ChannelError> {
        let room = self.room(topic).await.ok_or(ChannelError::Closed)?;
        room.track(conn_id, record).await
    }

    pub async fn untrack(&self, topic: &str, conn_id: Uuid) -> bool {
        match self.room(topic).await {
            Some(room) => room.untrack(conn_id).await,
            None => false,
        }
    }

    /// Remove `conn_id` from `topic`, dropping the room once it is empty.
    pub async fn leave(&self, topic: &str, conn_id: Uuid) -> bool {
        let Some(room) = self.room(topic).await else {
            return false;
        };
        let left = room.leave(conn_id).await;
        self.remove_if_empty(topic).await;
        left
    }

    pub async fn snapshot(&self, topic: &str) -> PresenceSnapshot {
        match self.room(topic).await {
            Some(room) => room.snapshot().await,
            None => PresenceSnapshot::new(),
        }
    }

    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            if room.member_count().await == 0 {
                self.diffs_sent_closed_rooms
                    .fetch_add(room.diffs_sent(), Ordering::Relaxed);
                rooms.remove(topic);
                log::info!("Presence room {topic} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> HubStats {
        let rooms = self.rooms.read().await;
        let mut stats = HubStats {
            diffs_sent: self.diffs_sent_closed_rooms.load(Ordering::Relaxed),
            active_topics: rooms.len(),
            active_connections: 0,
        };
        for room in rooms.values() {
            stats.diffs_sent += room.diffs_sent();
            stats.active_connections += room.member_count().await;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "trip_presence:trip-1";

    #[tokio::test]
    async fn test_join_returns_current_state() {
        let hub = PresenceHub::with_defaults();
        let alice = Uuid::new_v4();
        let (_rx, state) = hub.join(TOPIC, alice, "alice").await.unwrap();
        assert!(state.is_empty());
        hub.track(TOPIC, alice, PresenceRecord::new("alice", "trip-1"))
            .await
            .unwrap();

        let (_rx, state) = hub.join(TOPIC, Uuid::new_v4(), "bob").await.unwrap();
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_track_fans_out_replacement() {
        let hub = PresenceHub::with_defaults();
        let alice = Uuid::new_v4();
        let (mut rx, _) = hub.join(TOPIC, alice, "alice").await.unwrap();

        hub.track(TOPIC, alice, PresenceRecord::new("alice", "trip-1"))
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert!(first.leaves.is_empty());
        let first_ref = first.joins["alice"][0].presence_ref.clone();

        hub.track(TOPIC, alice, PresenceRecord::new("alice", "trip-1"))
            .await
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.leaves["alice"][0].presence_ref, first_ref);
        assert_ne!(second.joins["alice"][0].presence_ref, first_ref);
        assert_eq!(hub.snapshot(TOPIC).await["alice"].len(), 1);
    }

    #[tokio::test]
    async fn test_track_without_join_fails() {
        let hub = PresenceHub::with_defaults();
        let result = hub
            .track(TOPIC, Uuid::new_v4(), PresenceRecord::new("x", "trip-1"))
            .await;
        assert_eq!(result, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_leave_sends_leave_and_removes_room() {
        let hub = PresenceHub::with_defaults();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_a, _) = hub.join(TOPIC, alice, "alice").await.unwrap();
        let (mut rx, _) = hub.join(TOPIC, bob, "bob").await.unwrap();
        hub.track(TOPIC, alice, PresenceRecord::new("alice", "trip-1"))
            .await
            .unwrap();
        let _join = rx.recv().await.unwrap();

        assert!(hub.leave(TOPIC, alice).await);
        let diff = rx.recv().await.unwrap();
        assert!(diff.leaves.contains_key("alice"));
        assert_eq!(hub.room_count().await, 1);

        assert!(hub.leave(TOPIC, bob).await);
        assert_eq!(hub.room_count().await, 0);
        assert!(!hub.leave(TOPIC, bob).await);
    }

    #[tokio::test]
    async fn test_untrack_keeps_membership() {
        let hub = PresenceHub::with_defaults();
        let alice = Uuid::new_v4();
        let (_rx, _) = hub.join(TOPIC, alice, "alice").await.unwrap();
        hub.track(TOPIC, alice, PresenceRecord::new("alice", "trip-1"))
            .await
            .unwrap();
        assert!(hub.untrack(TOPIC, alice).await);
        assert!(!hub.untrack(TOPIC, alice).await);
        assert!(hub.snapshot(TOPIC).await.is_empty());
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_topic_member_limit() {
        let hub = PresenceHub::new(16, 2);
        let (_a, _) = hub.join(TOPIC, Uuid::new_v4(), "a").await.unwrap();
        let (_b, _) = hub.join(TOPIC, Uuid::new_v4(), "b").await.unwrap();
        let third = hub.join(TOPIC, Uuid::new_v4(), "c").await;
        assert!(matches!(third, Err(ChannelError::SubscribeFailed(_))));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = PresenceHub::with_defaults();
        let alice = Uuid::new_v4();
        let (_a, _) = hub.join("trip_presence:one", alice, "alice").await.unwrap();
        let (mut other, _) = hub
            .join("trip_presence:two", Uuid::new_v4(), "bob")
            .await
            .unwrap();
        hub.track("trip_presence:one", alice, PresenceRecord::new("alice", "one"))
            .await
            .unwrap();
        assert!(other.try_recv().is_err());

        let topics = hub.active_topics().await;
        assert_eq!(topics.len(), 2);
        let stats = hub.stats().await;
        assert_eq!(stats.active_topics, 2);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.diffs_sent, 1);
    }
}
