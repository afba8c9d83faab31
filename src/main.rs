//! safepath - journey risk engine server.
//!
//! # API Endpoints
//!
//! - `POST /journeys/start`, `/journeys/resume`, `/journeys/end` - Journey lifecycle
//! - `POST /journeys/telemetry` - Submit a telemetry reading
//! - `POST /journeys/analyze-risk` - Assess a reading without storing it
//! - `GET /journeys`, `/journeys/:id`, `/journeys/:id/history` - Journey queries
//! - `POST /alerts`, `GET /alerts`, `/alerts/dashboard`, `/alerts/:id` - Alerts
//! - `POST /alerts/:id/resolve` - Resolve an alert
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use safepath::api::{AppState, router};
use safepath::config::EngineConfig;
use safepath::engine::Engine;
use safepath::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("safepath=info".parse()?))
        .init();

    let config = EngineConfig::load()?;
    let port = config.server.port;
    let db_url = config.server.database_url.clone();

    info!(port, db_url = %db_url, "Starting safepath server");

    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let engine = Arc::new(Engine::new(config, Arc::new(storage)));

    // Journeys left open by a previous run come back paused.
    let recovered = engine.recover().await?;
    info!(recovered, "Open journeys restored");

    let app = router(AppState { engine }).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "safepath is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
