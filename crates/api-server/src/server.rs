//! API server — serves the campaign REST API and the Prometheus exporter.

use crate::rest::{self, AppState};
use axum::routing::get;
use axum::Router;
use campaign_core::config::AppConfig;
use campaign_management::{campaign_router, handlers, ManagementState};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    management: ManagementState,
}

impl ApiServer {
    pub fn new(config: AppConfig, management: ManagementState) -> Self {
        Self { config, management }
    }

    /// The full application router with middleware applied.
    pub fn router(&self) -> Router {
        let state = AppState {
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
            management: self.management.clone(),
        };

        let operational = Router::new()
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            .with_state(state);

        Router::new()
            .merge(operational)
            .merge(campaign_router(self.management.clone()))
            .fallback(handlers::not_found)
            // Middleware
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Start the HTTP REST server. Returns once `shutdown` resolves and
    /// in-flight requests have drained.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
