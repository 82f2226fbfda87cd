//! Presence data model.
//!
//! A [`PresenceRecord`] is one user's live state on one trip. The record
//! is what gets tracked on the realtime channel and upserted in the
//! backing store, so it is serde-serializable in both the JSON form
//! (camelCase fields, lowercase status) and the binary wire form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Status
// ───────────────────────────────────────────────────────────────────

/// Liveness of a user on a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Editing,
    Offline,
}

impl PresenceStatus {
    pub const ALL: [PresenceStatus; 4] = [
        PresenceStatus::Online,
        PresenceStatus::Away,
        PresenceStatus::Editing,
        PresenceStatus::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Editing => "editing",
            PresenceStatus::Offline => "offline",
        }
    }

    /// Everything except `offline` counts as present.
    pub fn is_active(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a caller hands us a status string we don't know.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown presence status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for PresenceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PresenceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Record
// ───────────────────────────────────────────────────────────────────

/// Pointer position in page coordinates, stamped when it was sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    pub timestamp: u64,
}

/// One user's live state on one trip.
///
/// Invariant: `editing_item_id.is_some()` implies `status == Editing`.
/// The mutators below keep it; code that writes the fields directly is
/// on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub trip_id: String,
    pub status: PresenceStatus,
    pub editing_item_id: Option<String>,
    pub cursor_position: Option<CursorPosition>,
    /// Milliseconds since the Unix epoch.
    pub last_active_at: u64,
    pub page_path: String,
    pub display_name: Option<String>,
}

impl PresenceRecord {
    /// A fresh `online` record stamped with the current time.
    pub fn new(user_id: impl Into<String>, trip_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            trip_id: trip_id.into(),
            status: PresenceStatus::Online,
            editing_item_id: None,
            cursor_position: None,
            last_active_at: now_millis(),
            page_path: String::new(),
            display_name: None,
        }
    }

    pub fn with_page_path(mut self, page_path: impl Into<String>) -> Self {
        self.page_path = page_path.into();
        self
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    pub fn with_status(mut self, status: PresenceStatus) -> Self {
        self.set_status(status);
        self
    }

    /// Set the status, dropping the editing item unless the new status is `editing`.
    pub fn set_status(&mut self, status: PresenceStatus) {
        self.status = status;
        if status != PresenceStatus::Editing {
            self.editing_item_id = None;
        }
    }

    pub fn begin_editing(&mut self, item_id: impl Into<String>) {
        self.status = PresenceStatus::Editing;
        self.editing_item_id = Some(item_id.into());
    }

    pub fn end_editing(&mut self) {
        self.set_status(PresenceStatus::Online);
    }

    pub fn touch(&mut self, at: u64) {
        self.last_active_at = at;
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_editing(&self) -> bool {
        self.status == PresenceStatus::Editing
    }

    /// True when the editing invariant holds.
    pub fn is_consistent(&self) -> bool {
        self.editing_item_id.is_none() || self.status == PresenceStatus::Editing
    }
}
