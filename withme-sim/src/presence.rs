//! Simulated users joining, editing and leaving a trip.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use withme_collab::{
    PresenceApi, PresenceConfig, PresenceOptions, PresenceSession, PresenceStore, PresenceView,
    RealtimeClient,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

fn describe(view: &PresenceView) -> String {
    let users: Vec<String> = view
        .active_users
        .iter()
        .map(|r| match &r.editing_item_id {
            Some(item) => format!("{}({} {item})", r.user_id, r.status),
            None => format!("{}({})", r.user_id, r.status),
        })
        .collect();
    format!("[{}] {} ", users.join(", "), view.connection_state)
}

pub async fn run(
    trip_id: &str,
    users: usize,
    config: PresenceConfig,
    client: Arc<dyn RealtimeClient>,
    store: Arc<dyn PresenceStore>,
) {
    if !config.enabled {
        info!("Presence disabled, skipping presence simulation");
        return;
    }

    let sessions: Vec<PresenceSession> = (1..=users)
        .map(|n| {
            let user = format!("user-{n}");
            PresenceSession::start(
                trip_id,
                &user,
                PresenceOptions {
                    page_path: format!("/trips/{trip_id}"),
                    display_name: Some(format!("Traveller {n}")),
                },
                config.clone(),
                client.clone(),
                store.clone(),
            )
        })
        .collect();

    let Some(observer) = sessions.first() else {
        return;
    };
    let mut views = observer.watch();
    let everyone = tokio::time::timeout(
        SETTLE_TIMEOUT,
        views.wait_for(|view| view.active_users.len() == users),
    )
    .await;
    match everyone {
        Ok(Ok(view)) => info!("Everyone is here: {}", describe(&view)),
        Ok(Err(_)) => warn!("Observer session ended early"),
        Err(_) => warn!("Not all users showed up: {}", describe(&observer.view())),
    }

    if let Some(editor) = sessions.get(1) {
        editor.start_editing("item-museum");
        editor.record_cursor(320.0, 180.0);
    }
    tokio::time::sleep(config.publish_debounce * 4).await;
    info!("After edit: {}", describe(&observer.view()));

    for session in sessions.into_iter().rev() {
        let cleanup = session.shutdown().await;
        if !cleanup.settled().await {
            warn!("A session left without a clean offline write");
        }
    }

    match store.active_members(trip_id, config.active_members_limit).await {
        Ok(left) => info!("Active members after shutdown: {}", left.len()),
        Err(e) => warn!("Could not read active members: {e}"),
    }
}
