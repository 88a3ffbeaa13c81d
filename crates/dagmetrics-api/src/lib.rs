//! dagmetrics-api — HTTP surface for the exporter.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `<server.route>` | Metrics exposition (default `/admin/metrics/`) |
//! | GET | `/healthz` | Liveness check |
//!
//! `server.plain_text` picks which of the two metrics handlers is mounted.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tracing::{debug, warn};

use dagmetrics_collector::MetricsCollector;
use dagmetrics_core::ServerConfig;

pub const HEALTH_ROUTE: &str = "/healthz";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub collector: Arc<MetricsCollector>,
}

/// Build the exporter router.
pub fn build_router(collector: Arc<MetricsCollector>, server: &ServerConfig) -> Router {
    let state = ApiState { collector };
    let route = normalize_route(&server.route);

    let metrics = if server.plain_text {
        get(handlers::plain_metrics)
    } else {
        get(handlers::prometheus_metrics)
    };
    debug!(route = %route, plain_text = server.plain_text, "mounting metrics route");

    let mut router = Router::new().route(&route, metrics);
    if route == HEALTH_ROUTE {
        warn!("metrics route shadows the health check");
    } else {
        router = router.route(HEALTH_ROUTE, get(handlers::healthz));
    }
    router.with_state(state)
}

fn normalize_route(route: &str) -> String {
    let trimmed = route.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
