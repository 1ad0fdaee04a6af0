mod api;
mod config;
mod control;
mod devices;
mod engine;
mod error;
mod group;
mod memory;
mod mqtt;
mod reconciler;
mod state;
mod timer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use api::AppState;
use devices::TopicCache;
use engine::{Engine, EventQueue};
use memory::SqliteMasterMemory;
use state::GroupStates;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lightgroup=debug")),
        )
        .init();

    tracing::info!("Starting lightgroup v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("LIGHTGROUP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("lightgroup.yaml"));
    let settings = config::load(&config_path)?;
    tracing::info!(
        "Loaded {} groups from {}",
        settings.groups.len(),
        config_path.display()
    );

    let memory = SqliteMasterMemory::open(&settings.storage.path)?;
    tracing::info!("Master memory at {}", settings.storage.path.display());

    // Queue and registry exist before MQTT so retained messages land somewhere.
    let queue = EventQueue::new();
    let cache = Arc::new(TopicCache::new());
    let (bus, _mqtt_handle) =
        mqtt::start(&settings.mqtt, &settings.groups, cache.clone(), queue.sender());
    tracing::info!(
        "MQTT client connecting to {}:{}",
        settings.mqtt.host,
        settings.mqtt.port
    );

    // Give the broker time to replay retained device state before validating topics.
    tokio::time::sleep(Duration::from_millis(settings.settle_ms)).await;
    tracing::info!("Topic registry holds {} controls", cache.len());

    let states = Arc::new(GroupStates::new());
    let engine = Engine::new(
        &settings.groups,
        cache.as_ref(),
        memory,
        bus,
        states.clone(),
        queue,
    );
    let events = engine.sender();
    tokio::spawn(engine.run());

    let app_state = Arc::new(AppState {
        states,
        events,
        started: Instant::now(),
    });
    let app = api::router(app_state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
