//! API server

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::ApiState;
use super::routes;

/// UI-facing HTTP server
pub struct ApiServer {
    state: ApiState,
    host: String,
    port: u16,
}

impl ApiServer {
    pub fn new(state: ApiState, host: String, port: u16) -> Self {
        Self { state, host, port }
    }

    pub fn router(state: ApiState) -> Router {
        Router::new()
            .nest("/api", routes::router())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve until shutdown
    pub async fn start(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server to {addr}"))?;
        tracing::info!(addr = %addr, "API server listening");

        let mut shutdown_rx = self.state.shutdown_rx.clone();
        let app = Self::router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
            })
            .await
            .context("API server error")?;

        Ok(())
    }
}
