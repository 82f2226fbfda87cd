//! WebSocket presence server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Diff ──► Client A
//!            ├── PresenceHub ── room ┤
//! Client B ──┘     (topic)           └── Diff ──► Client B
//! ```
//!
//! One socket carries one channel: the first frame must be
//! `ClientFrame::Join`. After that the connection may track, untrack
//! and ping until it sends `Leave` or the socket closes; either way its
//! meta is untracked and every other subscriber sees a leave.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::PresenceDiff;
use crate::hub::PresenceHub;
use crate::protocol::{ClientFrame, ServerFrame};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per topic
    pub max_members_per_topic: usize,
    /// Diff buffer per subscriber before it is resynced with a full state
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_topic: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_joins: u64,
    pub active_topics: usize,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The presence server. Cheap to clone; clones share the hub and stats.
#[derive(Clone)]
pub struct PresenceServer {
    config: ServerConfig,
    hub: Arc<PresenceHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl PresenceServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(PresenceHub::new(
            config.broadcast_capacity,
            config.max_members_per_topic,
        ));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Presence server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let conn_id = Uuid::new_v4();
        let mut topic: Option<String> = None;
        let mut diffs: Option<broadcast::Receiver<Arc<PresenceDiff>>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                let frame = match ClientFrame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let replies = self.handle_frame(conn_id, frame, &mut topic, &mut diffs).await;
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                return Ok(());
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                return Ok(());
                            }
                            Some(Ok(_)) => {}
                        }
                    }

                    diff = async {
                        match diffs.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let frame = match diff {
                            Ok(diff) => ServerFrame::Diff((*diff).clone()),
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Connection {conn_id} lagged by {n} diffs, resyncing");
                                let Some(t) = topic.as_deref() else { continue };
                                ServerFrame::State(self.hub.snapshot(t).await)
                            }
                            Err(RecvError::Closed) => {
                                diffs = None;
                                continue;
                            }
                        };
                        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    }
                }
            }
        }
        .await;

        if let Some(t) = topic.take() {
            if self.hub.leave(&t, conn_id).await {
                log::info!("Connection {conn_id} left {t} on disconnect");
            }
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_topics = self.hub.room_count().await;
        }

        result
    }

    /// Apply one client frame and return the frames to send back.
    async fn handle_frame(
        &self,
        conn_id: Uuid,
        frame: ClientFrame,
        topic: &mut Option<String>,
        diffs: &mut Option<broadcast::Receiver<Arc<PresenceDiff>>>,
    ) -> Vec<ServerFrame> {
        match (frame, topic.as_deref()) {
            (ClientFrame::Join { topic: wanted, key }, None) => {
                match self.hub.join(&wanted, conn_id, &key).await {
                    Ok((rx, state)) => {
                        log::info!("Connection {conn_id} joined {wanted} as {key}");
                        *diffs = Some(rx);
                        *topic = Some(wanted.clone());
                        self.stats.write().await.active_topics = self.hub.room_count().await;
                        vec![ServerFrame::Joined { topic: wanted, state }]
                    }
                    Err(e) => {
                        log::warn!("Join of {wanted} by {key} rejected: {e}");
                        self.stats.write().await.rejected_joins += 1;
                        vec![ServerFrame::JoinRejected { reason: e.to_string() }]
                    }
                }
            }
            (ClientFrame::Join { topic: wanted, .. }, Some(current)) => {
                log::warn!("Connection {conn_id} already in {current}, join of {wanted} ignored");
                vec![ServerFrame::JoinRejected {
                    reason: format!("already joined {current}"),
                }]
            }
            (ClientFrame::Track(record), Some(current)) => {
                log::trace!("Track {} on {current}: {}", record.user_id, record.status);
                if let Err(e) = self.hub.track(current, conn_id, record).await {
                    log::warn!("Track on {current} failed: {e}");
                }
                Vec::new()
            }
            (ClientFrame::Untrack, Some(current)) => {
                self.hub.untrack(current, conn_id).await;
                Vec::new()
            }
            (ClientFrame::Leave, Some(current)) => {
                self.hub.leave(current, conn_id).await;
                log::info!("Connection {conn_id} left {current}");
                *topic = None;
                *diffs = None;
                self.stats.write().await.active_topics = self.hub.room_count().await;
                Vec::new()
            }
            (ClientFrame::Ping, _) => vec![ServerFrame::Pong],
            (frame, None) => {
                log::debug!("Frame {frame:?} before join ignored");
                Vec::new()
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }
}
