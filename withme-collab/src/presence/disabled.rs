use tokio::sync::watch;

use super::state::PresenceView;
use super::PresenceApi;

/// Stand-in used when presence is switched off. Every command is a
/// no-op and the view never changes from its defaults.
pub struct DisabledPresence {
    view_tx: watch::Sender<PresenceView>,
}

impl DisabledPresence {
    pub fn new() -> Self {
        let (view_tx, _) = watch::channel(PresenceView::default());
        Self { view_tx }
    }
}

impl Default for DisabledPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceApi for DisabledPresence {
    fn view(&self) -> PresenceView {
        self.view_tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<PresenceView> {
        self.view_tx.subscribe()
    }

    fn record_activity(&self) {}

    fn record_cursor(&self, _x: f64, _y: f64) {}

    fn start_editing(&self, _item_id: &str) {}

    fn stop_editing(&self) {}

    fn set_status(&self, _status: &str) {}

    fn recover(&self) {}
}
