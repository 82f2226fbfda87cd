//! The live presence session.
//!
//! One actor task per session owns every piece of mutable state: the
//! local record, the open channel, the timers and the view. Commands
//! from the handle, channel events and timer deadlines are handled one
//! at a time in a single `select!` loop, and the view is republished
//! after each of them.
//!
//! ```text
//!  PresenceSession ──Command──►┐
//!                              │          ┌──► watch<PresenceView>
//!  Channel handlers ──Signal──►├─► Actor ─┤
//!                              │          └──► Channel / PresenceStore
//!  retry / publish / away /    │
//!  subscribe deadlines ───────►┘
//! ```
//!
//! Channel callbacks only forward a [`Signal`] tagged with the
//! connection generation; signals from a torn-down channel are dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use withme_core::{now_millis, CursorPosition, PresenceRecord, PresenceStatus};

use super::cleanup::{CleanupHandle, CleanupJob};
use super::config::PresenceConfig;
use super::state::{merge_records, merge_snapshot, PresenceError, PresenceView, SessionPhase};
use super::PresenceApi;
use crate::channel::{
    Channel, ChannelConfig, ChannelEvent, EventHandler, EventKind, RealtimeClient,
    SubscribeStatus,
};
use crate::storage::PresenceStore;

/// Topic of the membership channel for a trip.
pub fn presence_topic(trip_id: &str) -> String {
    format!("trip_presence:{trip_id}")
}

/// Caller-supplied details of the local user's record.
#[derive(Debug, Clone, Default)]
pub struct PresenceOptions {
    pub page_path: String,
    pub display_name: Option<String>,
}

enum Command {
    RecordActivity,
    RecordCursor { x: f64, y: f64 },
    StartEditing(String),
    StopEditing,
    SetStatus(PresenceStatus),
    Recover,
    Shutdown(oneshot::Sender<CleanupHandle>),
}

struct Signal {
    generation: u64,
    kind: SignalKind,
}

enum SignalKind {
    Status(SubscribeStatus),
    Sync,
    Join { key: String, count: usize },
    Leave { key: String, count: usize },
}

impl SignalKind {
    fn from_event(event: &ChannelEvent) -> Self {
        match event {
            ChannelEvent::Sync => SignalKind::Sync,
            ChannelEvent::Join { key, new, .. } => SignalKind::Join {
                key: key.clone(),
                count: new.len(),
            },
            ChannelEvent::Leave { key, left, .. } => SignalKind::Leave {
                key: key.clone(),
                count: left.len(),
            },
        }
    }
}

/// Handle to a running presence session.
///
/// Dropping the handle stops the session the same way [`shutdown`](Self::shutdown)
/// does, without a way to wait for the cleanup.
pub struct PresenceSession {
    commands: Option<mpsc::UnboundedSender<Command>>,
    view_rx: watch::Receiver<PresenceView>,
    /// Keeps the view alive for a session that never started.
    _idle_view: Option<watch::Sender<PresenceView>>,
    task: Option<JoinHandle<()>>,
}

impl PresenceSession {
    /// Start a session for `user_id` on `trip_id`.
    ///
    /// With an empty trip or user the session stays `NotReady` and never
    /// touches the channel or the store.
    pub fn start(
        trip_id: &str,
        user_id: &str,
        options: PresenceOptions,
        config: PresenceConfig,
        client: Arc<dyn RealtimeClient>,
        store: Arc<dyn PresenceStore>,
    ) -> Self {
        let (view_tx, view_rx) = watch::channel(PresenceView::with_phase(SessionPhase::NotReady));

        if trip_id.is_empty() || user_id.is_empty() {
            log::debug!("Presence not ready: trip {trip_id:?}, user {user_id:?}");
            return Self {
                commands: None,
                view_rx,
                _idle_view: Some(view_tx),
                task: None,
            };
        }

        let record = PresenceRecord::new(user_id, trip_id)
            .with_page_path(options.page_path)
            .with_display_name(options.display_name);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let actor = Actor {
            away_at: Some(now + config.away_timeout),
            last_activity: now,
            config,
            client,
            store,
            record,
            channel: None,
            generation: 0,
            attempt: 0,
            subscribed: false,
            synced: false,
            view: PresenceView::with_phase(SessionPhase::NotReady),
            view_tx,
            signal_tx,
            retry_at: None,
            publish_at: None,
            subscribe_deadline: None,
        };
        let task = tokio::spawn(actor.run(command_rx, signal_rx));

        Self {
            commands: Some(command_tx),
            view_rx,
            _idle_view: None,
            task: Some(task),
        }
    }

    /// Stop the session: publish `offline`, leave the channel and mark
    /// the user offline in the store, all in the background.
    pub async fn shutdown(mut self) -> CleanupHandle {
        let Some(commands) = self.commands.take() else {
            return CleanupHandle::settled_now();
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(Command::Shutdown(reply_tx)).is_err() {
            return CleanupHandle::settled_now();
        }
        reply_rx.await.unwrap_or_else(|_| CleanupHandle::settled_now())
    }

    /// Whether the actor task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn send(&self, command: Command) {
        if let Some(commands) = &self.commands {
            if commands.send(command).is_err() {
                log::debug!("Presence session already stopped");
            }
        }
    }
}

impl PresenceApi for PresenceSession {
    fn view(&self) -> PresenceView {
        self.view_rx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<PresenceView> {
        self.view_rx.clone()
    }

    fn record_activity(&self) {
        self.send(Command::RecordActivity);
    }

    fn record_cursor(&self, x: f64, y: f64) {
        self.send(Command::RecordCursor { x, y });
    }

    fn start_editing(&self, item_id: &str) {
        self.send(Command::StartEditing(item_id.to_string()));
    }

    fn stop_editing(&self) {
        self.send(Command::StopEditing);
    }

    fn set_status(&self, status: &str) {
        match status.parse::<PresenceStatus>() {
            Ok(status) => self.send(Command::SetStatus(status)),
            Err(e) => log::warn!("Ignoring status update: {e}"),
        }
    }

    fn recover(&self) {
        self.send(Command::Recover);
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

struct Actor {
    config: PresenceConfig,
    client: Arc<dyn RealtimeClient>,
    store: Arc<dyn PresenceStore>,
    record: PresenceRecord,
    channel: Option<Arc<dyn Channel>>,
    /// Bumped on every teardown; tags signals from the current channel.
    generation: u64,
    attempt: u32,
    /// `subscribed` was handled for the current channel.
    subscribed: bool,
    /// A membership sync arrived on the current channel.
    synced: bool,
    view: PresenceView,
    view_tx: watch::Sender<PresenceView>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    last_activity: Instant,
    retry_at: Option<Instant>,
    publish_at: Option<Instant>,
    away_at: Option<Instant>,
    subscribe_deadline: Option<Instant>,
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        self.connect(0).await;
        self.publish_view();

        let check = self.config.inactivity_check_interval;
        let mut inactivity = interval_at(Instant::now() + check, check);
        inactivity.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let beat = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + beat, beat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.into_cleanup());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Handle dropped without shutdown.
                        drop(self.into_cleanup());
                        return;
                    }
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                _ = sleep_opt(self.retry_at) => {
                    self.retry_at = None;
                    if let SessionPhase::Backoff { retry } = self.view.phase {
                        self.connect(retry).await;
                    }
                }
                _ = sleep_opt(self.subscribe_deadline) => {
                    self.subscribe_deadline = None;
                    log::warn!("No subscribe status for trip {} within {:?}", self.record.trip_id, self.config.subscribe_timeout);
                    self.fail(
                        self.attempt + 1,
                        PresenceError::Connection("subscribe timed out".into()),
                    );
                }
                _ = sleep_opt(self.publish_at) => {
                    self.publish_at = None;
                    self.publish().await;
                }
                _ = sleep_opt(self.away_at) => {
                    self.away_at = None;
                    self.go_away();
                }
                _ = inactivity.tick() => self.check_inactivity(),
                _ = heartbeat.tick() => self.heartbeat().await,
            }
            self.publish_view();
        }
    }

    fn publish_view(&self) {
        let view = &self.view;
        self.view_tx.send_if_modified(|current| {
            if current == view {
                return false;
            }
            *current = view.clone();
            true
        });
    }

    fn enter(&mut self, next: SessionPhase) {
        if let Err(e) = self.view.enter(next) {
            log::warn!("{e}");
        }
    }

    // ─── Connection lifecycle ──────────────────────────────

    async fn connect(&mut self, attempt: u32) {
        self.teardown();
        self.attempt = attempt;
        self.enter(SessionPhase::Connecting { attempt });

        let topic = presence_topic(&self.record.trip_id);
        let mut channel_config = ChannelConfig::new(self.record.user_id.clone());
        channel_config.join_timeout = self.config.subscribe_timeout;
        log::info!("Connecting presence on {topic} (attempt {attempt})");

        let channel = match self.client.open_channel(&topic, channel_config).await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(attempt + 1, PresenceError::Connection(e.to_string()));
                return;
            }
        };

        let generation = self.generation;
        let forward = |signal_tx: mpsc::UnboundedSender<Signal>| -> EventHandler {
            Box::new(move |event: &ChannelEvent| {
                let _ = signal_tx.send(Signal {
                    generation,
                    kind: SignalKind::from_event(event),
                });
            })
        };
        channel.on(EventKind::Sync, forward(self.signal_tx.clone()));
        // Our own joins and leaves are already reflected by the next sync.
        for kind in [EventKind::Join, EventKind::Leave] {
            let own_key = self.record.user_id.clone();
            channel.on_matching(
                kind,
                Box::new(move |event: &ChannelEvent| event.key() != Some(own_key.as_str())),
                forward(self.signal_tx.clone()),
            );
        }
        let signal_tx = self.signal_tx.clone();
        channel.subscribe(Box::new(move |status| {
            let _ = signal_tx.send(Signal {
                generation,
                kind: SignalKind::Status(status),
            });
        }));

        self.channel = Some(channel);
        self.subscribe_deadline = Some(Instant::now() + self.config.subscribe_timeout);
    }

    /// Drop the current channel. Late signals from it are ignored.
    ///
    /// The old channel leaves in the background, so a stalled transport
    /// never holds up the actor.
    fn teardown(&mut self) {
        self.generation += 1;
        self.subscribed = false;
        self.synced = false;
        self.subscribe_deadline = None;
        if let Some(channel) = self.channel.take() {
            let limit = self.config.subscribe_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(limit, channel.unsubscribe()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::debug!("Unsubscribe from {} failed: {e}", channel.topic()),
                    Err(_) => log::debug!("Unsubscribe from {} timed out", channel.topic()),
                }
            });
        }
    }

    /// Tear down and schedule retry number `retry`, or give up.
    fn fail(&mut self, retry: u32, error: PresenceError) {
        self.teardown();
        match self.config.retry.delay_for(retry) {
            Some(delay) => {
                log::warn!(
                    "Presence on trip {} failed ({error}), retry {retry} in {delay:?}",
                    self.record.trip_id
                );
                self.view.error = Some(error);
                self.enter(SessionPhase::Backoff { retry });
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                log::error!(
                    "Presence on trip {} failed ({error}), giving up after {retry} attempts",
                    self.record.trip_id
                );
                self.view.error = Some(PresenceError::RetriesExhausted { attempts: retry });
                self.enter(SessionPhase::Disconnected);
                self.retry_at = None;
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) {
        if signal.generation != self.generation {
            log::trace!("Dropping signal from a closed channel");
            return;
        }
        match signal.kind {
            SignalKind::Status(SubscribeStatus::Subscribed) => self.on_subscribed().await,
            SignalKind::Status(status) => match self.view.phase {
                SessionPhase::Connecting { .. } => {
                    self.fail(self.attempt + 1, PresenceError::Connection(status.to_string()));
                }
                SessionPhase::Connected => {
                    self.fail(1, PresenceError::Connection(status.to_string()));
                }
                _ => {}
            },
            SignalKind::Sync => self.on_sync(),
            SignalKind::Join { key, count } => {
                log::debug!("{key} joined trip {} ({count} new)", self.record.trip_id);
            }
            SignalKind::Leave { key, count } => {
                log::debug!("{key} left trip {} ({count} gone)", self.record.trip_id);
            }
        }
    }

    async fn on_subscribed(&mut self) {
        let connecting = matches!(self.view.phase, SessionPhase::Connecting { .. });
        if self.subscribed || !(connecting || self.view.phase == SessionPhase::Connected) {
            return;
        }
        let Some(channel) = self.channel.clone() else {
            return;
        };
        self.subscribed = true;
        self.subscribe_deadline = None;

        self.record.touch(now_millis());
        if let Err(e) = channel.track(&self.record).await {
            self.fail(self.attempt + 1, PresenceError::Connection(format!("track failed: {e}")));
            return;
        }

        if connecting {
            self.enter(SessionPhase::Connected);
        }
        self.view.error = None;
        log::info!(
            "Presence connected on {} as {}",
            channel.topic(),
            self.record.user_id
        );

        self.persist().await;
        if !self.synced {
            self.seed_members().await;
        }
    }

    fn on_sync(&mut self) {
        self.synced = true;
        if let SessionPhase::Connecting { .. } = self.view.phase {
            self.enter(SessionPhase::Connected);
            self.subscribe_deadline = None;
            self.view.error = None;
        }
        let Some(channel) = &self.channel else {
            return;
        };
        let users = merge_snapshot(&channel.presence_state());
        self.set_members(users);
    }

    async fn seed_members(&mut self) {
        match self
            .store
            .active_members(&self.record.trip_id, self.config.active_members_limit)
            .await
        {
            Ok(records) => {
                log::debug!("Seeded {} members from the store", records.len());
                self.set_members(merge_records(records));
            }
            Err(e) => log::warn!("Could not load active members: {e}"),
        }
    }

    fn set_members(&mut self, users: Vec<PresenceRecord>) {
        self.view.my_presence = users
            .iter()
            .find(|r| r.user_id == self.record.user_id)
            .cloned();
        self.view.active_users = users;
    }

    // ─── Publishing ────────────────────────────────────────

    /// Reflect the local record in the view and schedule a publish.
    fn mark_dirty(&mut self) {
        self.view.status = self.record.status;
        self.view.editing_item_id = self.record.editing_item_id.clone();
        if self.publish_at.is_none() {
            self.publish_at = Some(Instant::now() + self.config.publish_debounce);
        }
    }

    /// Track the local record and write it to the store. Before the
    /// channel is subscribed there is nothing to do: subscribing tracks
    /// the latest record anyway.
    async fn publish(&mut self) {
        if self.view.phase != SessionPhase::Connected || !self.subscribed {
            return;
        }
        let Some(channel) = self.channel.clone() else {
            return;
        };
        log::debug!(
            "Publishing {} as {} on trip {}",
            self.record.user_id,
            self.record.status,
            self.record.trip_id
        );
        if let Err(e) = channel.track(&self.record).await {
            self.fail(1, PresenceError::Connection(format!("track failed: {e}")));
            return;
        }
        self.persist().await;
    }

    async fn persist(&mut self) {
        match self.store.upsert_presence(&self.record).await {
            Ok(()) => {
                if matches!(self.view.error, Some(PresenceError::Persistence(_))) {
                    self.view.error = None;
                }
            }
            Err(e) => {
                log::error!("Failed to store presence for {}: {e}", self.record.user_id);
                self.view.error = Some(PresenceError::Persistence(e.to_string()));
            }
        }
    }

    async fn heartbeat(&mut self) {
        if self.view.phase == SessionPhase::Connected {
            self.record.touch(now_millis());
            self.publish().await;
        }
    }

    // ─── Local state ───────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RecordActivity => self.touch_activity(),
            Command::RecordCursor { x, y } => {
                self.touch_activity();
                log::trace!("Cursor of {} at ({x}, {y})", self.record.user_id);
                self.record.cursor_position = Some(CursorPosition {
                    x,
                    y,
                    timestamp: now_millis(),
                });
                self.mark_dirty();
            }
            Command::StartEditing(item_id) => {
                self.touch_activity();
                self.record.begin_editing(item_id);
                self.mark_dirty();
            }
            Command::StopEditing => {
                if self.record.is_editing() {
                    self.record.end_editing();
                    self.mark_dirty();
                }
            }
            Command::SetStatus(status) => {
                self.record.set_status(status);
                self.mark_dirty();
            }
            Command::Recover => self.recover().await,
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    async fn recover(&mut self) {
        match self.view.phase {
            SessionPhase::Connected => {
                log::info!("Refreshing presence on trip {}", self.record.trip_id);
                self.record.touch(now_millis());
                self.publish().await;
            }
            SessionPhase::Backoff { .. } | SessionPhase::Disconnected => {
                log::info!("Recovering presence on trip {}", self.record.trip_id);
                self.retry_at = None;
                self.view.error = None;
                self.connect(0).await;
            }
            _ => log::debug!("Recover ignored in {:?}", self.view.phase),
        }
    }

    fn touch_activity(&mut self) {
        let now = Instant::now();
        self.last_activity = now;
        self.away_at = Some(now + self.config.away_timeout);
        self.record.touch(now_millis());
        if self.record.status == PresenceStatus::Away {
            self.record.set_status(PresenceStatus::Online);
            self.mark_dirty();
        }
    }

    fn check_inactivity(&mut self) {
        if self.last_activity.elapsed() >= self.config.away_timeout {
            self.go_away();
        }
    }

    /// Only `online` goes away; `editing` waits for `stop_editing`.
    fn go_away(&mut self) {
        if self.record.status == PresenceStatus::Online {
            log::debug!("{} is away", self.record.user_id);
            self.record.set_status(PresenceStatus::Away);
            self.mark_dirty();
        }
    }

    // ─── Shutdown ──────────────────────────────────────────

    fn into_cleanup(mut self) -> CleanupHandle {
        log::info!(
            "Stopping presence for {} on trip {}",
            self.record.user_id,
            self.record.trip_id
        );
        self.enter(SessionPhase::Stopping);
        self.view.is_cleaning_up = true;
        self.publish_view();

        self.record.set_status(PresenceStatus::Offline);
        self.record.cursor_position = None;
        self.record.touch(now_millis());

        CleanupHandle::spawn(CleanupJob {
            channel: self.channel.take(),
            store: self.store.clone(),
            record: self.record.clone(),
            failsafe_delay: self.config.cleanup_failsafe_delay,
            view_tx: self.view_tx,
        })
    }
}
