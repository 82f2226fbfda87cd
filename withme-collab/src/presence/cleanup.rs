//! Fire-and-forget teardown of a presence session.
//!
//! Two tasks share a completion flag and a cancellation token:
//!
//! ```text
//! primary:  track(offline) → unsubscribe → store.mark_offline → done ─┐
//!                                                                     │ cancel
//! failsafe: sleep(failsafe_delay) ──► done? no → store.mark_offline ◄─┘
//! ```
//!
//! Nothing is awaited on the caller's behalf. Dropping the
//! [`CleanupHandle`] detaches both tasks; [`CleanupHandle::settled`]
//! waits for them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use withme_core::PresenceRecord;

use super::state::{PresenceView, SessionPhase};
use crate::channel::Channel;
use crate::storage::PresenceStore;

/// Inputs to one cleanup run.
pub(crate) struct CleanupJob {
    pub channel: Option<Arc<dyn Channel>>,
    pub store: Arc<dyn PresenceStore>,
    /// The final record, already `offline`.
    pub record: PresenceRecord,
    pub failsafe_delay: Duration,
    pub view_tx: watch::Sender<PresenceView>,
}

pub struct CleanupHandle {
    completed: Arc<AtomicBool>,
    failsafe: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    pub(crate) fn spawn(job: CleanupJob) -> Self {
        let completed = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let CleanupJob {
            channel,
            store,
            record,
            failsafe_delay,
            view_tx,
        } = job;

        {
            let completed = completed.clone();
            let token = token.clone();
            let store = store.clone();
            let record = record.clone();
            tokio::spawn(async move {
                if let Some(channel) = channel {
                    if let Err(e) = channel.track(&record).await {
                        log::debug!("Offline track on {} failed: {e}", channel.topic());
                    }
                    if let Err(e) = channel.unsubscribe().await {
                        log::debug!("Unsubscribe from {} failed: {e}", channel.topic());
                    }
                }
                mark_offline(store.as_ref(), &record).await;
                completed.store(true, Ordering::SeqCst);
                token.cancel();
            });
        }

        let failsafe = {
            let completed = completed.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(failsafe_delay) => {
                        if !completed.load(Ordering::SeqCst) {
                            log::warn!(
                                "Cleanup for {} on trip {} still pending after {failsafe_delay:?}, writing offline directly",
                                record.user_id,
                                record.trip_id
                            );
                            mark_offline(store.as_ref(), &record).await;
                        }
                    }
                }

                // Nobody is watching once every receiver is gone.
                if !view_tx.is_closed() {
                    view_tx.send_modify(|view| {
                        if view.enter(SessionPhase::Stopped).is_err() {
                            log::debug!("Cleanup finished outside the stopping phase");
                        }
                        view.is_cleaning_up = false;
                        view.active_users.clear();
                        view.my_presence = None;
                    });
                }
                log::info!("Presence for {} on trip {} stopped", record.user_id, record.trip_id);
            })
        };

        Self {
            completed,
            failsafe: Some(failsafe),
        }
    }

    /// A handle for a session that had nothing to clean up.
    pub fn settled_now() -> Self {
        Self {
            completed: Arc::new(AtomicBool::new(true)),
            failsafe: None,
        }
    }

    /// Whether the primary chain ran to the end.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Wait until the failsafe has resolved, then report whether the
    /// primary chain completed.
    pub async fn settled(mut self) -> bool {
        if let Some(failsafe) = self.failsafe.take() {
            if let Err(e) = failsafe.await {
                log::warn!("Cleanup failsafe task failed: {e}");
            }
        }
        self.is_complete()
    }
}

async fn mark_offline(store: &dyn PresenceStore, record: &PresenceRecord) {
    match store
        .mark_offline(&record.trip_id, &record.user_id, record.last_active_at)
        .await
    {
        Ok(true) => log::debug!("Marked {} offline on trip {}", record.user_id, record.trip_id),
        Ok(false) => log::debug!("No presence row to mark offline for {}", record.user_id),
        Err(e) => log::error!("Failed to mark {} offline: {e}", record.user_id),
    }
}
