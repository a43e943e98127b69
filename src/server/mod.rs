//! HTTP and WebSocket surface over the engine.
//!
//! - `GET /health`
//! - `GET|POST /api/executions`, `GET /api/executions/{id}`
//! - `POST /api/executions/{id}/{start|pause|resume|rollback}`
//! - `GET /api/executions/{id}/issues`, `PATCH /api/executions/{id}/issues/{issue_id}`
//! - `GET /api/executions/{id}/metrics`
//! - `GET /ws[?execution_id=...]` live update feed

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::engine::Engine;
pub use api::{AppState, SharedState};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for a locally served dashboard
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            dev_mode: false,
        }
    }
}

/// Build the full application router with the REST API and the WebSocket feed.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve until Ctrl+C.
pub async fn start_server(engine: Arc<Engine>, config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState { engine });
    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "cutover server listening");
    println!("cutover server running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;
    use crate::testing::ScriptedExecutor;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let engine = Engine::new(
            Arc::new(ScriptedExecutor::new()),
            Arc::new(MemoryRepository::new()),
        );
        build_router(Arc::new(AppState {
            engine: Arc::new(engine),
        }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }
}
