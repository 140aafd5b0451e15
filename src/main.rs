//! qbdeck backend entry point
//!
//! Wires together the database, the per-instance client pool, the sync
//! engine and the WebSocket notifier, then serves the REST API.

mod api;
mod config;
mod db;
mod qbit;
mod sync;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::Database;
use qbit::QbClientPool;
use sync::SyncEngine;
use ws::ChangeNotifier;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub clients: Arc<QbClientPool>,
    pub notifier: Arc<ChangeNotifier>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qbdeck=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting qbdeck backend");

    if let Some(parent) = std::path::Path::new(&config.database_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::connect(&config.database_path).await?;
    tracing::info!(path = %config.database_path, "Database connected");

    let clients = Arc::new(QbClientPool::new());

    let notifier = Arc::new(ChangeNotifier::new());
    notifier
        .clone()
        .start_heartbeat(Duration::from_secs(config.ws_heartbeat_secs));

    let engine = Arc::new(SyncEngine::new(
        db.clone(),
        clients.clone(),
        notifier.clone(),
        Duration::from_millis(config.sync_interval_ms),
    ));
    let _engine_handle = engine.start();
    tracing::info!("Sync engine started");

    let state = AppState {
        config: config.clone(),
        db,
        clients,
        notifier,
    };

    let app = Router::new()
        .merge(api::health::router())
        .nest("/api", api::instances::router())
        .nest("/api", api::torrents::router())
        .route("/ws", get(ws::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
