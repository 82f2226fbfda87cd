//! Binary frames exchanged between [`WsClient`](crate::client::WsClient)
//! and [`PresenceServer`](crate::server::PresenceServer).
//!
//! One WebSocket carries one channel. Every frame is a bincode-encoded
//! (serde mode, standard config) enum in a binary WebSocket message:
//!
//! ```text
//! client                                  server
//!   │ ── Join { topic, key } ───────────────► │
//!   │ ◄──────────── Joined { state } ──────── │   or JoinRejected { reason }
//!   │ ── Track(record) ─────────────────────► │
//!   │ ◄──────────── Diff { joins, leaves } ── │   fanned out to the topic
//!   │ ── Untrack / Leave / Ping ────────────► │
//!   │ ◄──────────── State(snapshot) ───────── │   resync after lag
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use withme_core::PresenceRecord;

use crate::channel::{PresenceDiff, PresenceSnapshot};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Join { topic: String, key: String },
    Track(PresenceRecord),
    Untrack,
    Leave,
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Joined { topic: String, state: PresenceSnapshot },
    JoinRejected { reason: String },
    /// Full membership, sent when a subscriber fell behind the fan-out.
    State(PresenceSnapshot),
    Diff(PresenceDiff),
    Pong,
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerFrame::Joined { .. } => "joined",
            ServerFrame::JoinRejected { .. } => "join_rejected",
            ServerFrame::State(_) => "state",
            ServerFrame::Diff(_) => "diff",
            ServerFrame::Pong => "pong",
        }
    }
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(frame)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
