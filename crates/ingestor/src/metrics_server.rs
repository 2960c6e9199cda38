use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

pub fn build_router() -> axum::Router<()> {
    use axum::routing::get;

    axum::Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Serve `/metrics` and `/healthz` until shutdown.
pub async fn serve(port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");

    axum::serve(listener, build_router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics() -> (axum::http::StatusCode, String) {
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::default_registry().gather())
    {
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Ok(result) => (axum::http::StatusCode::OK, result),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_renders_registered_instruments() {
        // Touch a few instruments so they appear in the rendering.
        crate::metrics::MESSAGES_TOTAL.inc();
        crate::metrics::FAILURES_TOTAL
            .with_label_values(&["checksum_mismatch"])
            .inc();
        crate::metrics::NLP_SOURCE_TOTAL
            .with_label_values(&["upstream"])
            .inc();

        let (status, body) = prometheus_metrics().await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert!(body.contains("audio_ingest_messages_total"));
        assert!(body.contains(r#"audio_ingest_failures_total{reason="checksum_mismatch"}"#));
        assert!(body.contains(r#"audio_ingest_nlp_source_total{source="upstream"}"#));
    }
}
