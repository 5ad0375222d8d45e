//! Status and metrics handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use mailsift_core::protocol::StatusResponse;
use std::sync::Arc;
use tracing::error;

use crate::state::MasterState;

/// Liveness probe used by workers before they authenticate
pub async fn status(State(state): State<Arc<MasterState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.queue.name().to_string(),
        sessions: state.session_count(),
    })
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<Arc<MasterState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
