//! HTTP handlers

use crate::AppState;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json},
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.metrics.to_json())
}

/// Prometheus text exposition format
pub async fn get_metrics_prometheus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// Health check endpoint for Docker/Kubernetes
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let breaker = match state
        .metrics
        .export
        .circuit_breaker_state
        .load(Ordering::Relaxed)
    {
        0 => "closed",
        1 => "open",
        _ => "half_open",
    };
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.metrics.uptime_seconds(),
        "circuit_breaker": breaker,
    }))
}

#[cfg(test)]
mod tests {
    use crate::MetricsServer;
    use sessiontrace_core::metrics::create_metrics;
    use std::sync::atomic::Ordering;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_endpoints() {
        let metrics = create_metrics();
        metrics
            .ingest
            .records_received
            .fetch_add(7, Ordering::Relaxed);
        metrics.export.circuit_breaker_state.store(1, Ordering::Relaxed);

        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), metrics, "sessiontrace")
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));

        let prom = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert!(prom.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain; version=0.0.4"));
        let text = prom.text().await.unwrap();
        assert!(text.contains("records_received_total 7"));

        let json: serde_json::Value = reqwest::get(format!("{}/api/metrics", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["ingest"]["records_received"], 7);

        let health: serde_json::Value = reqwest::get(format!("{}/api/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["circuit_breaker"], "open");

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let first = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), create_metrics(), "a")
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();
        assert!(MetricsServer::bind(taken, create_metrics(), "b").await.is_err());
    }
}
