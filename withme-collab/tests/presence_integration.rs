//! Integration tests for the presence session manager.
//!
//! Most tests drive the session through a scripted channel so subscribe
//! outcomes, membership syncs and lost connections happen on demand.
//! Timer-dependent tests run on a paused clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{timeout, Duration, Instant};
use withme_collab::channel::ChannelCore;
use withme_collab::{
    Channel, ChannelConfig, ChannelError, EventKind, LocalClient, MemoryStore, PresenceApi,
    PresenceConfig, PresenceError, PresenceHub, PresenceMeta, PresenceOptions, PresenceSession,
    PresenceSnapshot, PresenceStore, PresenceView, RealtimeClient, SessionPhase, StoreError,
    SubscribeStatus,
};
use withme_collab::presence::Presence;
use withme_collab::ConnectionState;
use withme_core::{PresenceRecord, PresenceStatus};

// ─── Scripted channel ────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Subscribe,
    Error,
    /// Never report a status.
    Hang,
}

struct ScriptedChannel {
    core: ChannelCore,
    behaviour: Behaviour,
    hang_unsubscribe: bool,
    tracked: Mutex<Vec<PresenceRecord>>,
    unsubscribed: AtomicBool,
}

impl ScriptedChannel {
    fn tracked(&self) -> Vec<PresenceRecord> {
        self.tracked.lock().unwrap().clone()
    }

    fn last_tracked(&self) -> Option<PresenceRecord> {
        self.tracked.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    fn topic(&self) -> &str {
        self.core.topic()
    }

    fn on(&self, kind: EventKind, handler: withme_collab::channel::EventHandler) {
        self.core.register(kind, handler);
    }

    fn subscribe(&self, on_status: withme_collab::channel::StatusCallback) {
        self.core.set_status_callback(on_status);
        match self.behaviour {
            Behaviour::Subscribe => self.core.report(SubscribeStatus::Subscribed),
            Behaviour::Error => self.core.report(SubscribeStatus::ChannelError("refused".into())),
            Behaviour::Hang => {}
        }
    }

    async fn track(&self, record: &PresenceRecord) -> Result<(), ChannelError> {
        self.tracked.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn presence_state(&self) -> PresenceSnapshot {
        self.core.snapshot()
    }

    async fn unsubscribe(&self) -> Result<(), ChannelError> {
        if self.hang_unsubscribe {
            std::future::pending::<()>().await;
        }
        self.unsubscribed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedClient {
    script: Mutex<VecDeque<Behaviour>>,
    fallback: Behaviour,
    hang_unsubscribe: bool,
    opens: Mutex<Vec<Instant>>,
    channels: Mutex<Vec<Arc<ScriptedChannel>>>,
}

impl ScriptedClient {
    fn new(fallback: Behaviour) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback)
    }

    fn scripted(script: Vec<Behaviour>, fallback: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            hang_unsubscribe: false,
            opens: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        })
    }

    fn hanging_unsubscribe() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Behaviour::Subscribe,
            hang_unsubscribe: true,
            opens: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        })
    }

    fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    fn open_gaps_ms(&self) -> Vec<u128> {
        let opens = self.opens.lock().unwrap();
        opens.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect()
    }

    async fn latest_channel(&self) -> Arc<ScriptedChannel> {
        loop {
            if let Some(channel) = self.channels.lock().unwrap().last().cloned() {
                return channel;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl RealtimeClient for ScriptedClient {
    async fn open_channel(
        &self,
        topic: &str,
        _config: ChannelConfig,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        self.opens.lock().unwrap().push(Instant::now());
        let behaviour = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        let channel = Arc::new(ScriptedChannel {
            core: ChannelCore::new(topic),
            behaviour,
            hang_unsubscribe: self.hang_unsubscribe,
            tracked: Mutex::new(Vec::new()),
            unsubscribed: AtomicBool::new(false),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }
}

struct FailingStore;

#[async_trait]
impl PresenceStore for FailingStore {
    async fn upsert_presence(&self, _record: &PresenceRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }

    async fn mark_offline(&self, _: &str, _: &str, _: u64) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }

    async fn active_members(&self, _: &str, _: usize) -> Result<Vec<PresenceRecord>, StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

fn start(
    user: &str,
    config: PresenceConfig,
    client: Arc<dyn RealtimeClient>,
    store: Arc<dyn PresenceStore>,
) -> PresenceSession {
    PresenceSession::start(
        "trip-1",
        user,
        PresenceOptions {
            page_path: "/trips/trip-1".into(),
            display_name: Some(user.to_uppercase()),
        },
        config,
        client,
        store,
    )
}

async fn wait_view(
    rx: &mut watch::Receiver<PresenceView>,
    mut pred: impl FnMut(&PresenceView) -> bool,
) -> PresenceView {
    timeout(Duration::from_secs(600), rx.wait_for(|view| pred(view)))
        .await
        .expect("view condition not reached")
        .expect("session gone")
        .clone()
}

async fn connected(session: &PresenceSession) -> PresenceView {
    let mut rx = session.watch();
    wait_view(&mut rx, |v| v.phase == SessionPhase::Connected).await
}

fn other(user: &str) -> Vec<PresenceMeta> {
    vec![PresenceMeta {
        presence_ref: format!("ref-{user}"),
        record: PresenceRecord::new(user, "trip-1"),
    }]
}

// ─── Connection lifecycle ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_gives_up() {
    let client = ScriptedClient::new(Behaviour::Error);
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(MemoryStore::new()));

    let mut rx = session.watch();
    let view = wait_view(&mut rx, |v| v.phase == SessionPhase::Disconnected).await;

    assert_eq!(view.error, Some(PresenceError::RetriesExhausted { attempts: 6 }));
    assert_eq!(view.connection_state, ConnectionState::Disconnected);
    assert_eq!(client.open_count(), 6);
    assert_eq!(client.open_gaps_ms(), vec![3000, 6000, 12000, 24000, 30000]);

    // Stays put without a manual recover.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(client.open_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_recover_after_exhaustion() {
    let client = ScriptedClient::scripted(vec![Behaviour::Error, Behaviour::Error], Behaviour::Subscribe);
    let mut config = PresenceConfig::default();
    config.retry.max_retries = 1;
    let session = start("alice", config, client.clone(), Arc::new(MemoryStore::new()));

    let mut rx = session.watch();
    let view = wait_view(&mut rx, |v| v.phase == SessionPhase::Disconnected).await;
    assert_eq!(view.error, Some(PresenceError::RetriesExhausted { attempts: 2 }));

    session.recover();
    let view = wait_view(&mut rx, |v| v.phase == SessionPhase::Connected).await;
    assert_eq!(view.error, None);
    assert_eq!(client.open_count(), 3);

    // Recover while connected only refreshes.
    session.recover();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.open_count(), 3);
    assert_eq!(session.view().phase, SessionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_reconnects() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(MemoryStore::new()));
    connected(&session).await;

    let first = client.latest_channel().await;
    first.core.report(SubscribeStatus::Closed);

    let mut rx = session.watch();
    let view = wait_view(&mut rx, |v| v.phase == SessionPhase::Backoff { retry: 1 }).await;
    assert!(matches!(view.error, Some(PresenceError::Connection(_))));
    assert_eq!(view.connection_state, ConnectionState::Disconnected);

    let view = wait_view(&mut rx, |v| v.phase == SessionPhase::Connected).await;
    assert_eq!(view.error, None);
    assert_eq!(client.open_count(), 2);
    assert!(first.unsubscribed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_unsubscribe_does_not_block_reconnect() {
    let client = ScriptedClient::hanging_unsubscribe();
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(MemoryStore::new()));
    connected(&session).await;

    let lost_at = Instant::now();
    client.latest_channel().await.core.report(SubscribeStatus::Closed);

    let mut rx = session.watch();
    wait_view(&mut rx, |v| v.phase == SessionPhase::Backoff { retry: 1 }).await;
    assert!(lost_at.elapsed() < Duration::from_secs(1));

    // Commands keep flowing while the old channel is still leaving.
    session.start_editing("item-7");
    let view = wait_view(&mut rx, |v| v.status == PresenceStatus::Editing).await;
    assert_eq!(view.editing_item_id.as_deref(), Some("item-7"));

    wait_view(&mut rx, |v| v.phase == SessionPhase::Connected).await;
    assert!(lost_at.elapsed() < Duration::from_secs(5));
    assert_eq!(client.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_silent_subscribe_times_out() {
    let client = ScriptedClient::scripted(vec![Behaviour::Hang], Behaviour::Subscribe);
    let started = Instant::now();
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(MemoryStore::new()));

    let mut rx = session.watch();
    wait_view(&mut rx, |v| v.phase == SessionPhase::Backoff { retry: 1 }).await;
    assert!(started.elapsed() >= Duration::from_secs(10));

    connected(&session).await;
    assert_eq!(client.open_count(), 2);
}

// ─── Membership ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_sync_with_three_others() {
    let client = ScriptedClient::new(Behaviour::Hang);
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(MemoryStore::new()));
    let channel = client.latest_channel().await;

    let mut snapshot = PresenceSnapshot::new();
    for user in ["bob", "carol", "dave"] {
        snapshot.insert(user.into(), other(user));
    }
    channel.core.apply_state(snapshot);

    let mut rx = session.watch();
    let view = wait_view(&mut rx, |v| v.connection_state == ConnectionState::Connected).await;
    assert_eq!(view.my_presence, None);
    assert_eq!(view.active_users.len(), 3);
    assert_eq!(session.active_users().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_tracks_persists_and_seeds() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let store = Arc::new(MemoryStore::new());
    store.upsert_presence(&PresenceRecord::new("bob", "trip-1")).await.unwrap();

    let session = start("alice", PresenceConfig::default(), client.clone(), store.clone());
    let view = connected(&session).await;
    let channel = client.latest_channel().await;

    let tracked = channel.last_tracked().unwrap();
    assert_eq!(tracked.status, PresenceStatus::Online);
    assert_eq!(tracked.page_path, "/trips/trip-1");
    assert_eq!(tracked.display_name.as_deref(), Some("ALICE"));
    assert_eq!(channel.topic(), "trip_presence:trip-1");
    assert!(store.presence_of("trip-1", "alice").await.is_some());

    let users: Vec<&str> = view.active_users.iter().map(|r| r.user_id.as_str()).collect();
    assert_eq!(users, vec!["alice", "bob"]);
    assert_eq!(view.my_presence.map(|r| r.user_id), Some("alice".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_does_not_fail_connect() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(FailingStore));

    let view = connected(&session).await;
    assert!(matches!(view.error, Some(PresenceError::Persistence(_))));
    assert_eq!(view.connection_state, ConnectionState::Connected);
    assert_eq!(client.open_count(), 1);
}

#[tokio::test]
async fn test_two_sessions_over_local_hub() {
    let client: Arc<dyn RealtimeClient> = Arc::new(LocalClient::new(Arc::new(PresenceHub::with_defaults())));
    let store = Arc::new(MemoryStore::new());

    let alice = start("alice", PresenceConfig::default(), client.clone(), store.clone());
    let bob = start("bob", PresenceConfig::default(), client.clone(), store.clone());

    let mut rx = alice.watch();
    let view = wait_view(&mut rx, |v| v.active_users.len() == 2).await;
    assert_eq!(view.my_presence.map(|r| r.user_id), Some("alice".to_string()));

    assert!(bob.shutdown().await.settled().await);
    let view = wait_view(&mut rx, |v| v.active_users.len() == 1).await;
    assert_eq!(view.active_users[0].user_id, "alice");
    assert_eq!(
        store.presence_of("trip-1", "bob").await.map(|r| r.status),
        Some(PresenceStatus::Offline)
    );
}

// ─── Local status ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_editing_is_published_after_debounce() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(MemoryStore::new()));
    connected(&session).await;
    let channel = client.latest_channel().await;
    let before = channel.tracked().len();

    session.start_editing("item-7");
    let mut rx = session.watch();
    let view = wait_view(&mut rx, |v| v.editing_item_id.is_some()).await;
    assert!(view.is_editing());
    assert_eq!(session.editing_item_id().as_deref(), Some("item-7"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let tracked = channel.tracked();
    assert_eq!(tracked.len(), before + 1);
    let last = tracked.last().unwrap();
    assert_eq!(last.status, PresenceStatus::Editing);
    assert_eq!(last.editing_item_id.as_deref(), Some("item-7"));

    session.stop_editing();
    let view = wait_view(&mut rx, |v| v.editing_item_id.is_none()).await;
    assert_eq!(view.status, PresenceStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_status_is_ignored() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let session = start("alice", PresenceConfig::default(), client, Arc::new(MemoryStore::new()));
    connected(&session).await;

    session.set_status("sleeping");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(session.view().status, PresenceStatus::Online);

    session.set_status("away");
    let mut rx = session.watch();
    wait_view(&mut rx, |v| v.status == PresenceStatus::Away).await;
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_goes_away_and_activity_returns() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let session = start("alice", PresenceConfig::default(), client.clone(), Arc::new(MemoryStore::new()));
    connected(&session).await;

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(session.view().status, PresenceStatus::Away);
    let channel = client.latest_channel().await;
    assert_eq!(channel.last_tracked().unwrap().status, PresenceStatus::Away);

    session.record_cursor(10.0, 20.0);
    let mut rx = session.watch();
    wait_view(&mut rx, |v| v.status == PresenceStatus::Online).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let cursor = channel.last_tracked().unwrap().cursor_position.unwrap();
    assert_eq!((cursor.x, cursor.y), (10.0, 20.0));
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_leaves_editing_alone() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let session = start("alice", PresenceConfig::default(), client, Arc::new(MemoryStore::new()));
    connected(&session).await;

    session.start_editing("item-1");
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(session.view().status, PresenceStatus::Editing);
}

// ─── Not ready, disabled, shutdown ───────────────────────────────

#[tokio::test]
async fn test_not_ready_touches_nothing() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let store = Arc::new(MemoryStore::new());
    let session = start("", PresenceConfig::default(), client.clone(), store.clone());

    session.record_activity();
    session.start_editing("item-1");
    session.recover();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = session.view();
    assert_eq!(view.phase, SessionPhase::NotReady);
    assert!(view.is_loading);
    assert_eq!(view.error, None);
    assert_eq!(client.open_count(), 0);
    assert!(session.shutdown().await.settled().await);
}

#[tokio::test]
async fn test_disabled_presence_is_inert() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let config = PresenceConfig {
        enabled: false,
        ..PresenceConfig::default()
    };
    let presence = Presence::start(
        "trip-1",
        "alice",
        PresenceOptions::default(),
        config,
        client.clone(),
        Arc::new(MemoryStore::new()),
    );
    let api = presence.api();
    let before = api.view();

    api.start_editing("item-1");
    api.stop_editing();
    api.set_status("away");
    api.recover();

    assert_eq!(api.view(), before);
    assert!(api.active_users().is_empty());
    assert_eq!(client.open_count(), 0);
    assert!(presence.shutdown().await.settled().await);
}

#[tokio::test]
async fn test_shutdown_marks_offline() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let store = Arc::new(MemoryStore::new());
    let session = start("alice", PresenceConfig::default(), client.clone(), store.clone());
    connected(&session).await;
    let mut rx = session.watch();

    let cleanup = session.shutdown().await;
    assert!(cleanup.settled().await);

    let channel = client.latest_channel().await;
    assert_eq!(channel.last_tracked().unwrap().status, PresenceStatus::Offline);
    assert!(channel.unsubscribed.load(Ordering::SeqCst));
    assert_eq!(
        store.presence_of("trip-1", "alice").await.map(|r| r.status),
        Some(PresenceStatus::Offline)
    );

    let view = wait_view(&mut rx, |v| v.phase == SessionPhase::Stopped).await;
    assert!(!view.is_cleaning_up);
    assert!(view.active_users.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failsafe_writes_offline() {
    let client = ScriptedClient::hanging_unsubscribe();
    let store = Arc::new(MemoryStore::new());
    let session = start("alice", PresenceConfig::default(), client.clone(), store.clone());
    connected(&session).await;

    let stopped_at = Instant::now();
    let cleanup = session.shutdown().await;
    assert!(!cleanup.is_complete());
    assert!(!cleanup.settled().await);
    assert!(stopped_at.elapsed() >= Duration::from_secs(5));

    assert_eq!(
        store.presence_of("trip-1", "alice").await.map(|r| r.status),
        Some(PresenceStatus::Offline)
    );
}

#[tokio::test]
async fn test_dropping_session_cleans_up() {
    let client = ScriptedClient::new(Behaviour::Subscribe);
    let store = Arc::new(MemoryStore::new());
    let session = start("alice", PresenceConfig::default(), client.clone(), store.clone());
    connected(&session).await;
    drop(session);

    let channel = client.latest_channel().await;
    timeout(Duration::from_secs(5), async {
        while !channel.unsubscribed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
