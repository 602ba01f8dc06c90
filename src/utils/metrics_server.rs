// src/utils/metrics_server.rs
//
// Optional /metrics endpoint shared by the worker binaries.

use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};

// Axum handler for /metrics
pub async fn metrics_handler() -> (axum::http::StatusCode, String) {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("Could not encode prometheus metrics: {}", e);
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("Could not encode prometheus metrics: {}", e),
        );
    }
    match String::from_utf8(buffer) {
        Ok(s) => (axum::http::StatusCode::OK, s),
        Err(e) => {
            error!("Prometheus metrics UTF-8 error: {}", e);
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Prometheus metrics UTF-8 error: {}", e),
            )
        }
    }
}

/// Spawns the metrics listener when a port was given on the command line.
pub fn spawn_metrics_server(metrics_port: Option<u16>) {
    let Some(port) = metrics_port else {
        return;
    };

    let app = axum::Router::new().route("/metrics", axum::routing::get(metrics_handler));
    let listener_addr = format!("0.0.0.0:{}", port);
    info!(
        "Metrics endpoint will be available at http://{}/metrics",
        listener_addr
    );

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&listener_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    error!("Metrics server error: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to bind metrics server to {}: {}", listener_addr, e);
            }
        }
    });
}
