//! Liveness and metrics endpoints.

use super::AppState;
use crate::metrics::MetricsSnapshot;
use axum::extract::State;
use axum::Json;

pub async fn up() -> &'static str {
    "OK"
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.dispatcher.metrics().snapshot())
}
