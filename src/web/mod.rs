//! Read-only dashboard API.

mod handlers;

pub use handlers::*;

use crate::alert::AlertSentinel;
use crate::config::ServerConfig;
use crate::sentinel::ServiceSentinel;
use crate::server::ServerRegistry;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub sentinel: Arc<ServiceSentinel>,
    pub alerts: Arc<AlertSentinel>,
    pub servers: Arc<ServerRegistry>,
}

pub struct WebServer {
    state: AppState,
}

impl WebServer {
    pub fn new(
        config: ServerConfig,
        sentinel: Arc<ServiceSentinel>,
        alerts: Arc<AlertSentinel>,
        servers: Arc<ServerRegistry>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                sentinel,
                alerts,
                servers,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/healthz", get(handlers::handle_healthz))
            .route("/api/services", get(handlers::handle_get_services))
            .route("/api/monitors", get(handlers::handle_get_monitors))
            .route("/api/monitors/{id}", get(handlers::handle_get_monitor))
            .route("/api/alerts", get(handlers::handle_get_alerts))
            .route("/api/servers", get(handlers::handle_get_servers))
            .route("/api/cycle-transfer", get(handlers::handle_get_cycle_transfer))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until a stop signal arrives.
    pub async fn start(
        &self,
        mut stop: broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await?;

        Ok(())
    }
}
