//! Presence Session Manager.
//!
//! Keeps a live list of who is on a trip and publishes the local user's
//! own liveness over a [`Channel`](crate::channel::Channel), reconnecting
//! with bounded backoff when the channel fails.
//!
//! [`Presence::start`] honours the feature flag: with presence disabled
//! it returns [`DisabledPresence`], which implements the same
//! [`PresenceApi`] with no effects.

mod cleanup;
pub mod config;
mod disabled;
mod session;
pub mod state;

pub use cleanup::CleanupHandle;
pub use config::{PresenceConfig, RetryPolicy};
pub use disabled::DisabledPresence;
pub use session::{presence_topic, PresenceOptions, PresenceSession};
pub use state::{
    merge_snapshot, ConnectionState, InvalidTransition, PresenceError, PresenceView, SessionPhase,
};

use std::sync::Arc;

use tokio::sync::watch;
use withme_core::PresenceRecord;

use crate::channel::RealtimeClient;
use crate::storage::PresenceStore;

/// Read/command surface shared by live and disabled presence.
///
/// Commands never fail: invalid input is logged and dropped, and
/// connection or store failures show up in [`PresenceView::error`].
pub trait PresenceApi: Send + Sync {
    fn view(&self) -> PresenceView;

    /// Receiver that sees every view change.
    fn watch(&self) -> watch::Receiver<PresenceView>;

    /// Note user input: resets the away timer and brings `away` back to `online`.
    fn record_activity(&self);

    fn record_cursor(&self, x: f64, y: f64);

    fn start_editing(&self, item_id: &str);

    fn stop_editing(&self);

    /// Set the local status from its string form. Unknown values are ignored.
    fn set_status(&self, status: &str);

    /// Reconnect after a failure, or refresh when already connected.
    fn recover(&self);

    fn active_users(&self) -> Vec<PresenceRecord> {
        self.view().active_users
    }

    fn is_editing(&self) -> bool {
        self.view().is_editing()
    }

    fn editing_item_id(&self) -> Option<String> {
        self.view().editing_item_id
    }
}

/// Live or disabled presence, picked by [`PresenceConfig::enabled`].
pub enum Presence {
    Live(PresenceSession),
    Disabled(DisabledPresence),
}

impl Presence {
    pub fn start(
        trip_id: &str,
        user_id: &str,
        options: PresenceOptions,
        config: PresenceConfig,
        client: Arc<dyn RealtimeClient>,
        store: Arc<dyn PresenceStore>,
    ) -> Self {
        if !config.enabled {
            log::info!("Presence disabled");
            return Presence::Disabled(DisabledPresence::new());
        }
        Presence::Live(PresenceSession::start(
            trip_id, user_id, options, config, client, store,
        ))
    }

    pub fn api(&self) -> &dyn PresenceApi {
        match self {
            Presence::Live(session) => session,
            Presence::Disabled(disabled) => disabled,
        }
    }

    pub async fn shutdown(self) -> CleanupHandle {
        match self {
            Presence::Live(session) => session.shutdown().await,
            Presence::Disabled(_) => CleanupHandle::settled_now(),
        }
    }
}
