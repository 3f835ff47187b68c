use std::io;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::metrics::global_metrics;

/// Serve `GET /metrics` from the process-wide registry until the listener fails.
pub async fn run_metrics_exporter(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics exporter listening");
    serve_metrics_listener(listener).await
}

pub async fn serve_metrics_listener(listener: TcpListener) -> io::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    axum::serve(listener, app).await.map_err(io::Error::other)
}

async fn metrics_handler() -> String {
    global_metrics().render_prometheus()
}

#[cfg(test)]
mod tests {
    use super::metrics_handler;
    use crate::metrics::global_metrics;

    #[tokio::test]
    async fn metrics_handler_returns_prometheus_text() {
        global_metrics().record_message_in("aggregator", "aggregator_request_2", "EOF", 0.001);
        let body = metrics_handler().await;
        assert!(body.contains("cq_messages_in_total"));
        assert!(body.contains("aggregator_request_2"));
    }
}
