use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::db::Store;
use super::events::EventBroker;
use super::run_service::RunService;
use crate::config::Settings;

/// Configuration for the orchestrator server.
pub struct ServerConfig {
    pub port: u16,
    pub settings: Settings,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            settings: Settings::default(),
            dev_mode: false,
        }
    }
}

/// Build the application router over a shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Assemble the shared state: store, broker, run service.
pub fn build_state(settings: Settings) -> Result<Arc<AppState>> {
    std::fs::create_dir_all(&settings.workspace_root)
        .context("Failed to create workspace root")?;
    std::fs::create_dir_all(&settings.artifacts_root)
        .context("Failed to create artifacts root")?;

    let db = Store::new(&settings.database_path).context("Failed to open store")?;
    let events = Arc::new(EventBroker::new());
    let runs = RunService::new(settings.clone(), db.clone(), events);
    Ok(Arc::new(AppState { db, runs, settings }))
}

/// Start the orchestrator server and serve until Ctrl-C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = build_state(config.settings)?;

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    // Dev mode binds on all interfaces so a UI on another host can reach
    // the API; otherwise the service stays loopback-only.
    let bind_addr = if config.dev_mode {
        format!("0.0.0.0:{}", config.port)
    } else {
        format!("127.0.0.1:{}", config.port)
    };
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    println!("runweave listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("[server] interrupt received, draining connections");
        })
        .await
        .context("Server error")?;

    eprintln!("[server] stopped");
    Ok(())
}
