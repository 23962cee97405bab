//! `taskforge-server` — hosts the task execution engine behind the
//! push-stream WebSocket endpoint and a thin HTTP CRUD facade.

mod http;
mod state;
mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use taskforge_core::config::EngineConfig;
use taskforge_core::store::SqliteStore;
use taskforge_core::{telemetry, Engine};
use tracing::info;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    telemetry::init_telemetry(&config.telemetry)?;

    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let engine = Engine::new(config, store);
    let state = AppState { engine };

    let app = Router::new()
        .route("/stream/:task_id", get(ws::stream_handler))
        .merge(http::router())
        .with_state(state);

    let addr = std::env::var("TASKFORGE_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "taskforge-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Load `EngineConfig` from the file named by `TASKFORGE_CONFIG`, or the
/// built-in defaults if unset. No schema administration beyond this —
/// the embedded `SqliteStore` migration handles the database itself.
fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::var("TASKFORGE_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&text)?)
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}
