//! Self-observability endpoint for SessionTrace
//!
//! Serves the metrics registry as Prometheus text and JSON, plus a health
//! check for container orchestrators.

mod api;

use axum::{routing::get, Router};
use sessiontrace_core::metrics::SharedMetrics;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state
pub struct AppState {
    pub metrics: SharedMetrics,
    pub service_name: String,
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/metrics", get(api::get_metrics_prometheus))
        .route("/api/metrics", get(api::get_metrics))
        .route("/api/health", get(api::health_check))
        .layer(cors)
        .with_state(state)
}

/// A bound metrics server
pub struct MetricsServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl MetricsServer {
    /// Bind the metrics port; failure is fatal to the caller
    pub async fn bind(
        addr: SocketAddr,
        metrics: SharedMetrics,
        service_name: impl Into<String>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(AppState {
                metrics,
                service_name: service_name.into(),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.listener.local_addr()?;
        info!("Metrics available at http://{}", addr);
        info!("  - Prometheus at /metrics");
        info!("  - JSON at /api/metrics");
        info!("  - Health at /api/health");

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Metrics server stopped");
        Ok(())
    }
}
