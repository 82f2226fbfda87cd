//! WebSocket [`RealtimeClient`] talking to a [`PresenceServer`](crate::server::PresenceServer).
//!
//! Each channel owns one socket. `subscribe` connects and joins in a
//! background task and reports the outcome through the status callback:
//! `ChannelError` when the connect or join fails, `TimedOut` when no
//! join reply arrives in time, `Subscribed` on success and `Closed` if
//! the socket later drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use withme_core::PresenceRecord;

use crate::channel::{
    lock, Channel, ChannelConfig, ChannelCore, ChannelError, EventHandler, EventKind,
    PresenceSnapshot, RealtimeClient, StatusCallback, SubscribeStatus,
};
use crate::protocol::{ClientFrame, ServerFrame};

/// Connects channels to `ws://host:port`.
#[derive(Debug, Clone)]
pub struct WsClient {
    url: String,
}

impl WsClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RealtimeClient for WsClient {
    async fn open_channel(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        Ok(Arc::new(WsChannel::new(self.url.clone(), topic, config)))
    }
}

struct Shared {
    url: String,
    config: ChannelConfig,
    core: ChannelCore,
    outgoing: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    closing: AtomicBool,
}

impl Shared {
    fn sender(&self) -> Result<mpsc::Sender<ClientFrame>, ChannelError> {
        lock(&self.outgoing).clone().ok_or(ChannelError::Closed)
    }
}

pub struct WsChannel {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    fn new(url: String, topic: &str, config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                url,
                config,
                core: ChannelCore::new(topic),
                outgoing: Mutex::new(None),
                closing: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// Connect, join, then pump server frames until the socket closes.
    async fn run(shared: Arc<Shared>) {
        let topic = shared.core.topic().to_string();
        let joined =
            tokio::time::timeout(shared.config.join_timeout, Self::connect_and_join(&shared)).await;

        let (mut reader, state) = match joined {
            Ok(Ok(joined)) => joined,
            Ok(Err(e)) => {
                log::warn!("Joining {topic} failed: {e}");
                *lock(&shared.outgoing) = None;
                shared.core.report(SubscribeStatus::ChannelError(e.to_string()));
                return;
            }
            Err(_) => {
                log::warn!("Joining {topic} timed out");
                *lock(&shared.outgoing) = None;
                shared.core.report(SubscribeStatus::TimedOut);
                return;
            }
        };

        shared.core.report(SubscribeStatus::Subscribed);
        shared.core.apply_state(state);

        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                    Ok(ServerFrame::Diff(diff)) => shared.core.apply_diff(diff),
                    Ok(ServerFrame::State(state)) => shared.core.apply_state(state),
                    Ok(ServerFrame::Pong) => log::trace!("Pong on {topic}"),
                    Ok(other) => log::debug!("Unexpected {} frame on {topic}", other.name()),
                    Err(e) => log::warn!("Failed to decode frame on {topic}: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        *lock(&shared.outgoing) = None;
        if !shared.closing.load(Ordering::SeqCst) {
            log::warn!("Connection for {topic} lost");
            shared.core.report(SubscribeStatus::Closed);
        }
    }

    async fn connect_and_join(
        shared: &Shared,
    ) -> Result<(WsReader, PresenceSnapshot), ChannelError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(shared.url.as_str())
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let (mut writer, mut reader) = ws_stream.split();

        let join = ClientFrame::Join {
            topic: shared.core.topic().to_string(),
            key: shared.config.presence_key.clone(),
        };
        writer
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let state = loop {
            match reader.next().await {
                Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data)? {
                    ServerFrame::Joined { state, .. } => break state,
                    ServerFrame::JoinRejected { reason } => {
                        return Err(ChannelError::SubscribeFailed(reason));
                    }
                    other => {
                        log::debug!("Ignoring {} frame before join reply", other.name());
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
                Some(Ok(_)) => {}
            }
        };

        // Writer task: forward outgoing frames until every sender is gone.
        let (tx, mut rx) = mpsc::channel::<ClientFrame>(64);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });
        *lock(&shared.outgoing) = Some(tx);

        Ok((reader, state))
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        self.shared
            .sender()?
            .send(frame)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

type WsReader = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

#[async_trait]
impl Channel for WsChannel {
    fn topic(&self) -> &str {
        self.shared.core.topic()
    }

    fn on(&self, kind: EventKind, handler: EventHandler) {
        self.shared.core.register(kind, handler);
    }

    fn subscribe(&self, on_status: StatusCallback) {
        self.shared.core.set_status_callback(on_status);
        self.shared.closing.store(false, Ordering::SeqCst);
        let task = tokio::spawn(Self::run(self.shared.clone()));
        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
    }

    async fn track(&self, record: &PresenceRecord) -> Result<(), ChannelError> {
        self.send(ClientFrame::Track(record.clone())).await
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        self.send(ClientFrame::Untrack).await
    }

    fn presence_state(&self) -> PresenceSnapshot {
        self.shared.core.snapshot()
    }

    async fn unsubscribe(&self) -> Result<(), ChannelError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let sent = self.send(ClientFrame::Leave).await;
        // Dropping the last sender lets the writer close the socket.
        *lock(&self.shared.outgoing) = None;
        self.shared.core.reset();
        match sent {
            Ok(()) | Err(ChannelError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        *lock(&self.shared.outgoing) = None;
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}
