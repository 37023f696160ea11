//! Control plane
//!
//! REST API + lifecycle scheduler sharing one store and telemetry buffer

use anyhow::{Context, Result};
use control_plane::storage::ensure_root_user;
use control_plane::{
    create_router, AppState, Config, MemoryStore, RedisStore, Scheduler, SchedulerConfig,
    StdRandom, Store, StoreBackend, TelemetryStore,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting control plane");
    info!("Store backend: {:?}", config.store_backend);

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => {
            info!("Redis URL: {}", config.redis_url);
            Arc::new(
                RedisStore::new(&config.redis_url)
                    .await
                    .context("Failed to initialize Redis store")?,
            )
        }
    };

    let root = ensure_root_user(store.as_ref(), &config.root_username)
        .await
        .context("Failed to create bootstrap admin")?;
    info!("Bootstrap admin: {} (id {})", root.username, root.id);

    let telemetry = Arc::new(TelemetryStore::new());

    // Spawn scheduler task
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        SchedulerConfig {
            tick_interval: config.tick_interval(),
        },
        Arc::clone(&store),
        Arc::clone(&telemetry),
        Box::new(StdRandom::new(config.simulation_seed)),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let app = create_router(AppState {
        store,
        telemetry,
        root_username: config.root_username.clone(),
        stream_poll: config.stream_poll(),
    });

    // Start API server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Control plane API running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    // Let the scheduler finish its current tick
    shutdown_tx.send(true).ok();
    scheduler_handle.await.context("Scheduler task failed")?;

    Ok(())
}
