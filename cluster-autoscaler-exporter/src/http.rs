//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::collector::SharedCollector;
use crate::source::StatusSource;

/// Content type of the OpenMetrics text exposition format.
pub const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Application state shared across handlers.
struct AppState<S> {
    collector: SharedCollector<S>,
    metrics_path: String,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            collector: self.collector.clone(),
            metrics_path: self.metrics_path.clone(),
        }
    }
}

/// Create the HTTP router.
pub fn create_router<S: StatusSource>(collector: SharedCollector<S>, metrics_path: &str) -> Router {
    let state = AppState {
        collector,
        metrics_path: metrics_path.to_string(),
    };

    Router::new()
        .route("/", get(index_handler::<S>))
        .route(metrics_path, get(metrics_handler::<S>))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler::<S>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the metrics endpoint; every request runs one scrape cycle.
async fn metrics_handler<S: StatusSource>(State(state): State<AppState<S>>) -> Response {
    let (outcome, body) = state.collector.scrape().await;

    debug!(success = outcome.is_success(), "Served scrape");

    match body {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics\n",
            )
                .into_response()
        }
    }
}

/// Landing page linking to the metrics path.
async fn index_handler<S: StatusSource>(State(state): State<AppState<S>>) -> Html<String> {
    Html(format!(
        "<html>
<head><title>Cluster Autoscaler Exporter</title></head>
<body>
<h1>Cluster Autoscaler Exporter</h1>
<p><a href='{}'>Metrics</a></p>
</body>
</html>
",
        state.metrics_path
    ))
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler<S: StatusSource>(State(state): State<AppState<S>>) -> Response {
    if state.collector.has_succeeded() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no successful scrape yet\n",
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer<S> {
    collector: SharedCollector<S>,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl<S: StatusSource> HttpServer<S> {
    /// Create a new HTTP server.
    pub fn new(collector: SharedCollector<S>, listen_addr: SocketAddr, metrics_path: String) -> Self {
        Self {
            collector,
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let router = create_router(self.collector, &self.metrics_path);
        let local_addr = listener.local_addr().unwrap_or(self.listen_addr);

        info!(
            addr = %local_addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        // Run server with graceful shutdown
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                // Wait for shutdown signal
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
