//! Session phases, the observable presence view and snapshot merging.
//!
//! ```text
//!   NotReady ──► Connecting{0} ──► Connected ◄──────────┐
//!                    │   ▲             │                │ sync / subscribed
//!          failure   ▼   │ retry       ▼ lost           │
//!                Backoff{n} ◄──────────┘           Connecting{n}
//!                    │ retries used up
//!                    ▼
//!               Disconnected ──(recover)──► Connecting{0}
//!
//!   any live phase ──► Stopping ──► Stopped
//! ```
//!
//! `ConnectionState`, `is_loading` and the phase are never set
//! independently: the view derives the first two from the phase.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use withme_core::{PresenceRecord, PresenceStatus};

use crate::channel::PresenceSnapshot;

/// Recoverable failures surfaced on the presence view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("presence store write failed: {0}")]
    Persistence(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// The feature flag is off.
    #[default]
    Disabled,
    /// Waiting for a trip and a user.
    NotReady,
    /// Attempt 0 is the initial connect, attempt n the n-th retry.
    Connecting { attempt: u32 },
    Connected,
    /// Waiting to run retry `retry`.
    Backoff { retry: u32 },
    /// Retries used up; only `recover` leaves this phase.
    Disconnected,
    Stopping,
    Stopped,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid presence transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

impl SessionPhase {
    pub fn can_transition(&self, next: &SessionPhase) -> bool {
        use SessionPhase::*;
        match (*self, *next) {
            (Disabled, _) | (Stopped, _) => false,
            (NotReady, Connecting { attempt }) => attempt == 0,
            (NotReady, _) => false,
            (Connecting { .. }, Connected | Disconnected | Stopping) => true,
            (Connecting { attempt }, Backoff { retry }) => retry == attempt + 1,
            (Connecting { .. }, _) => false,
            (Connected, Backoff { .. } | Disconnected | Stopping) => true,
            (Connected, _) => false,
            (Backoff { retry }, Connecting { attempt }) => attempt == retry || attempt == 0,
            (Backoff { .. }, Stopping) => true,
            (Backoff { .. }, _) => false,
            (Disconnected, Connecting { attempt }) => attempt == 0,
            (Disconnected, Stopping) => true,
            (Disconnected, _) => false,
            (Stopping, Stopped) => true,
            (Stopping, _) => false,
        }
    }

    pub fn transition(&mut self, next: SessionPhase) -> Result<(), InvalidTransition> {
        if !self.can_transition(&next) {
            return Err(InvalidTransition { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self {
            SessionPhase::Connecting { .. } => ConnectionState::Connecting,
            SessionPhase::Connected => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, SessionPhase::NotReady | SessionPhase::Connecting { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        })
    }
}

/// Everything a UI reads from a presence session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceView {
    pub active_users: Vec<PresenceRecord>,
    pub my_presence: Option<PresenceRecord>,
    /// The local user's status, updated before it is published.
    pub status: PresenceStatus,
    pub error: Option<PresenceError>,
    pub phase: SessionPhase,
    pub connection_state: ConnectionState,
    pub is_loading: bool,
    pub is_cleaning_up: bool,
    pub editing_item_id: Option<String>,
}

impl PresenceView {
    pub(crate) fn with_phase(phase: SessionPhase) -> Self {
        Self {
            phase,
            connection_state: phase.connection_state(),
            is_loading: phase.is_loading(),
            ..Self::default()
        }
    }

    /// Move to `next`, keeping the derived fields in step.
    pub(crate) fn enter(&mut self, next: SessionPhase) -> Result<(), InvalidTransition> {
        self.phase.transition(next)?;
        self.connection_state = next.connection_state();
        self.is_loading = next.is_loading();
        Ok(())
    }

    pub fn is_editing(&self) -> bool {
        self.status == PresenceStatus::Editing
    }
}

/// Flatten a membership snapshot into one record per present user.
///
/// Offline entries are dropped. When a user is tracked by several
/// connections, the most recently active record wins. Sorted by user id.
pub fn merge_snapshot(snapshot: &PresenceSnapshot) -> Vec<PresenceRecord> {
    merge_records(
        snapshot
            .values()
            .flat_map(|metas| metas.iter().map(|meta| meta.record.clone())),
    )
}

pub fn merge_records(records: impl IntoIterator<Item = PresenceRecord>) -> Vec<PresenceRecord> {
    let mut latest: HashMap<String, PresenceRecord> = HashMap::new();
    for record in records.into_iter().filter(PresenceRecord::is_active) {
        match latest.get(&record.user_id) {
            Some(kept) if kept.last_active_at >= record.last_active_at => {}
            _ => {
                latest.insert(record.user_id.clone(), record);
            }
        }
    }
    let mut users: Vec<PresenceRecord> = latest.into_values().collect();
    users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    users
}
