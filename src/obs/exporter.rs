//! HTTP `/metrics` exporter.
//!
//! The endpoint is unauthenticated; the operator keeps the port behind a
//! network boundary.

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;

use crate::obs;

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> Response {
    match obs::gather_text() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}

/// Serve the registry until the process exits.
pub async fn serve(port: u16, addr: &str) -> Result<()> {
    obs::init();

    // A process-directory hint means the caller expects cross-process
    // aggregation; this runtime keeps a single in-process registry.
    if std::env::var("PROMETHEUS_MULTIPROC_DIR").is_ok() {
        tracing::warn!(
            "PROMETHEUS_MULTIPROC_DIR set but multiprocess collector unavailable, serving in-process registry"
        );
    }

    if !obs::metrics_enabled() {
        tracing::warn!("AR_ENABLE_METRICS!=1, metrics disabled (exporter serves empty registry)");
    }

    let bind = format!("{addr}:{port}");
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind metrics exporter on {bind}"))?;
    tracing::info!("metrics exporter on http://{bind}/metrics");

    axum::serve(listener, router()).await?;
    Ok(())
}
