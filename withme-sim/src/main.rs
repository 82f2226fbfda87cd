//! WithMe simulator — headless driver for the presence and itinerary stack.
//!
//! Starts a presence backend (in-process hub or a WebSocket server on a
//! local port), runs a few simulated users on one trip, then drags a few
//! itinerary items around and prints the resulting layout.
//!
//! Environment (a `.env` file is read first):
//! - `WITHME_SIM_BACKEND` — `local` (default) or `ws`
//! - `WITHME_SIM_USERS` — number of simulated users (default 3)
//! - `WITHME_SIM_DB` — RocksDB directory; in-memory store when unset
//! - `WITHME_PRESENCE_*` — see `PresenceConfig::from_env`
//! - `RUST_LOG` — log filter

mod itinerary;
mod presence;

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tokio::net::TcpListener;
use withme_collab::{
    ItemStore, LocalClient, MemoryStore, PresenceConfig, PresenceHub, PresenceServer,
    PresenceStore, RealtimeClient, RocksStore, ServerConfig, StoreConfig, WsClient,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const TRIP_ID: &str = "trip-lisbon";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Local,
    WebSocket,
}

#[derive(Debug, Clone)]
struct SimConfig {
    backend: Backend,
    users: usize,
    db_path: Option<PathBuf>,
}

impl SimConfig {
    fn from_env() -> Self {
        let backend = match std::env::var("WITHME_SIM_BACKEND").as_deref() {
            Ok("ws") => Backend::WebSocket,
            Ok("local") | Err(_) => Backend::Local,
            Ok(other) => {
                log::warn!("Unknown WITHME_SIM_BACKEND {other:?}, using local");
                Backend::Local
            }
        };
        let users = match std::env::var("WITHME_SIM_USERS") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!("Ignoring malformed WITHME_SIM_USERS={raw:?}");
                3
            }),
            Err(_) => 3,
        };
        Self {
            backend,
            users,
            db_path: std::env::var_os("WITHME_SIM_DB").map(PathBuf::from),
        }
    }
}

async fn realtime_client(backend: Backend) -> Result<Arc<dyn RealtimeClient>, BoxError> {
    match backend {
        Backend::Local => Ok(Arc::new(LocalClient::new(Arc::new(PresenceHub::with_defaults())))),
        Backend::WebSocket => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let url = format!("ws://{}", listener.local_addr()?);
            let server = PresenceServer::new(ServerConfig::default());
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    log::error!("Presence server stopped: {e}");
                }
            });
            info!("Presence server at {url}");
            Ok(Arc::new(WsClient::new(url)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let sim = SimConfig::from_env();
    let presence_config = PresenceConfig::from_env();
    info!("Starting WithMe simulator: {sim:?}");

    let client = realtime_client(sim.backend).await?;

    match &sim.db_path {
        Some(path) => {
            let store = RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            simulate(&sim, presence_config, client, Arc::new(store)).await?;
        }
        None => simulate(&sim, presence_config, client, Arc::new(MemoryStore::new())).await?,
    }

    info!("Simulation finished");
    Ok(())
}

async fn simulate<S>(
    sim: &SimConfig,
    presence_config: PresenceConfig,
    client: Arc<dyn RealtimeClient>,
    store: Arc<S>,
) -> Result<(), BoxError>
where
    S: PresenceStore + ItemStore + 'static,
{
    presence::run(TRIP_ID, sim.users, presence_config, client, store.clone()).await;
    itinerary::run(TRIP_ID, store.as_ref()).await?;
    Ok(())
}
