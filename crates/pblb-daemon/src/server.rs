//! HTTP front end
//!
//! `GET /metrics` returns the metrics snapshot; every other request is
//! handed to the balancer.

use axum::{
    extract::{Request, State},
    response::{Json, Response},
    routing::get,
    Router,
};
use pblb_network::{Balancer, InMemoryMetrics, MetricsSnapshot};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
pub struct AppState {
    pub balancer: Arc<Balancer>,
    pub metrics: Arc<InMemoryMetrics>,
}

/// Create the proxy router
pub fn create_router(balancer: Arc<Balancer>, metrics: Arc<InMemoryMetrics>) -> Router {
    let state = Arc::new(AppState { balancer, metrics });

    Router::new()
        .route("/metrics", get(get_metrics))
        .fallback(proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Forward any request to the balancer
async fn proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    state.balancer.handle(request).await
}

/// Current counters and gauges
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
