//! HTTP/WebSocket surface for gateway operation.
//!
//! This crate provides:
//! - REST API for device commands, polling control, alerts, and history
//! - WebSocket endpoint at `/socket` streaming gateway events
//! - Prometheus metrics at `/metrics`
//!
//! The API is a thin façade: every handler delegates to the device
//! manager, polling worker, or store and maps errors to structured
//! `{error, code}` objects.

mod api;
mod metrics;
mod state;
mod ws;

pub use api::ApiError;
pub use metrics::GatewayMetrics;
pub use state::AppContext;

use axum::{
    routing::{get, post, put},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Configuration for the web server.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Address to bind the server to.
    pub bind_addr: SocketAddr,
    /// Enable permissive CORS for browser clients.
    pub enable_cors: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid default address"),
            enable_cors: true,
        }
    }
}

/// Web server for the gateway API.
pub struct WebServer {
    config: WebConfig,
    context: Arc<AppContext>,
}

impl WebServer {
    /// Create a server over the shared application context.
    #[must_use]
    pub fn new(config: WebConfig, context: Arc<AppContext>) -> Self {
        Self { config, context }
    }

    /// Run the server until the shutdown signal flips.
    ///
    /// # Errors
    ///
    /// Returns an error when binding or serving fails.
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = self.config.bind_addr;
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        info!(addr = %bind_addr, "web server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await?;

        info!("web server stopped");
        Ok(())
    }

    /// Build the axum router with all routes. Also the entry point for
    /// in-process route tests, which drive it with `tower::ServiceExt`.
    pub fn build_router(self) -> Router {
        let mut app = Router::new()
            // Health and adapter
            .route("/api/health", get(api::health))
            .route("/api/adapter", get(api::adapter))
            // Devices
            .route("/api/devices", get(api::devices))
            .route("/api/discover", post(api::discover))
            .route("/api/devices/{unit_id}/identify", post(api::identify))
            .route("/api/devices/{unit_id}/alias", put(api::set_alias))
            .route("/api/devices/{unit_id}/unit_id", put(api::set_unit_id))
            // Polling control
            .route("/api/polling/start", post(api::polling_start))
            .route("/api/polling/stop", post(api::polling_stop))
            .route("/api/polling/status", get(api::polling_status))
            // Alerts
            .route("/api/alerts", get(api::alerts))
            .route("/api/alerts/{id}/acknowledge", post(api::acknowledge_alert))
            // History
            .route("/api/history/devices", get(api::history_devices))
            .route("/api/history/sensors/{unit_id}", get(api::history_sensors))
            .route("/api/history/data/{sensor_id}", get(api::history_data))
            .route("/api/history/stats", get(api::history_stats))
            // Prometheus metrics
            .route("/metrics", get(metrics::metrics_handler))
            // WebSocket endpoint
            .route("/socket", get(ws::socket_handler))
            .layer(Extension(self.context));

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            app = app.layer(cors);
        }

        app
    }
}
