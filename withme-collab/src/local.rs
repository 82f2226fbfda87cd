//! [`RealtimeClient`] over an in-process [`PresenceHub`].
//!
//! Used by tests and by the simulator when no server is running. Each
//! channel joins the hub as its own connection and pumps diffs into its
//! [`ChannelCore`] from a background task. Dropping a channel without
//! unsubscribing behaves like a dropped socket: the hub untracks it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;
use withme_core::PresenceRecord;

use crate::channel::{
    lock, Channel, ChannelConfig, ChannelCore, ChannelError, EventHandler, EventKind,
    PresenceSnapshot, RealtimeClient, StatusCallback, SubscribeStatus,
};
use crate::hub::PresenceHub;

#[derive(Clone)]
pub struct LocalClient {
    hub: Arc<PresenceHub>,
}

impl LocalClient {
    pub fn new(hub: Arc<PresenceHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }
}

#[async_trait]
impl RealtimeClient for LocalClient {
    async fn open_channel(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        Ok(Arc::new(LocalChannel::new(self.hub.clone(), topic, config)))
    }
}

struct Shared {
    hub: Arc<PresenceHub>,
    conn_id: Uuid,
    key: String,
    core: ChannelCore,
}

pub struct LocalChannel {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalChannel {
    fn new(hub: Arc<PresenceHub>, topic: &str, config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                hub,
                conn_id: Uuid::new_v4(),
                key: config.presence_key,
                core: ChannelCore::new(topic),
            }),
            pump: Mutex::new(None),
        }
    }

    async fn run_pump(shared: Arc<Shared>) {
        let topic = shared.core.topic().to_string();
        let (mut rx, state) = match shared.hub.join(&topic, shared.conn_id, &shared.key).await {
            Ok(joined) => joined,
            Err(e) => {
                shared.core.report(SubscribeStatus::ChannelError(e.to_string()));
                return;
            }
        };
        shared.core.report(SubscribeStatus::Subscribed);
        shared.core.apply_state(state);

        loop {
            match rx.recv().await {
                Ok(diff) => shared.core.apply_diff((*diff).clone()),
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Channel {topic} lagged by {n} diffs, resyncing");
                    let state = shared.hub.snapshot(&topic).await;
                    shared.core.apply_state(state);
                }
                Err(RecvError::Closed) => {
                    shared.core.report(SubscribeStatus::Closed);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn topic(&self) -> &str {
        self.shared.core.topic()
    }

    fn on(&self, kind: EventKind, handler: EventHandler) {
        self.shared.core.register(kind, handler);
    }

    fn subscribe(&self, on_status: StatusCallback) {
        self.shared.core.set_status_callback(on_status);
        let task = tokio::spawn(Self::run_pump(self.shared.clone()));
        if let Some(previous) = lock(&self.pump).replace(task) {
            previous.abort();
        }
    }

    async fn track(&self, record: &PresenceRecord) -> Result<(), ChannelError> {
        let shared = &self.shared;
        shared
            .hub
            .track(shared.core.topic(), shared.conn_id, record.clone())
            .await
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        let shared = &self.shared;
        shared.hub.untrack(shared.core.topic(), shared.conn_id).await;
        Ok(())
    }

    fn presence_state(&self) -> PresenceSnapshot {
        self.shared.core.snapshot()
    }

    async fn unsubscribe(&self) -> Result<(), ChannelError> {
        let pump = lock(&self.pump).take();
        if let Some(task) = pump {
            task.abort();
        }
        let shared = &self.shared;
        shared.hub.leave(shared.core.topic(), shared.conn_id).await;
        shared.core.reset();
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        let Some(task) = lock(&self.pump).take() else {
            return;
        };
        task.abort();
        let shared = self.shared.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if shared.hub.leave(shared.core.topic(), shared.conn_id).await {
                    log::debug!("Dropped channel {} left its topic", shared.core.topic());
                }
            });
        }
    }
}
