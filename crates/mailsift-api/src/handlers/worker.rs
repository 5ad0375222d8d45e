//! Worker RPC handlers
//!
//! `init` and `auth` run the handshake over plain JSON. Every other call
//! carries a body encrypted under the worker's session key; `work` and
//! `bye` additionally carry the next request id.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use mailsift_common::types::id_timestamp;
use mailsift_common::{ResultRecord, WorkerId};
use mailsift_core::protocol::{
    decode_b64, encode_b64, AckRequest, AuthRequest, InitRequest, InitResponse, Sequenced,
    OCTET_STREAM,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::MasterState;

fn parse_body<T: DeserializeOwned>(plain: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(plain).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn parse_uid(uid: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(uid).map_err(|e| ApiError::BadRequest(format!("invalid uid: {}", e)))
}

/// Start a handshake
pub async fn init(
    State(state): State<Arc<MasterState>>,
    Path(worker): Path<WorkerId>,
    Json(request): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    let message = decode_b64(&request.pake)
        .map_err(|e| ApiError::BadRequest(format!("pake: {}", e)))?;
    let reply = state.begin_handshake(worker, &message)?;
    Ok(Json(InitResponse {
        hk: encode_b64(&reply),
    }))
}

/// Finish a handshake with the worker's key confirmation
pub async fn auth(
    State(state): State<Arc<MasterState>>,
    Path(worker): Path<WorkerId>,
    Json(request): Json<AuthRequest>,
) -> Result<StatusCode, ApiError> {
    let tag = decode_b64(&request.hk).map_err(|e| ApiError::BadRequest(format!("hk: {}", e)))?;
    state.complete_handshake(worker, &tag)?;
    Ok(StatusCode::OK)
}

/// Hand out one work item
pub async fn work(
    State(state): State<Arc<MasterState>>,
    Path(worker): Path<WorkerId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (session, plain) = state.open(&worker, &body)?;
    let Sequenced { request_id } = parse_body(&plain)?;
    state.check_sequence(&worker, &session, request_id).await?;

    let item = state.pull_for(&worker).await?;
    let id = item.id;
    let ciphertext = session
        .key()
        .encrypt(&item.encode()?)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    debug!(%worker, %id, request_id, "Sent work item");
    Ok(([(header::CONTENT_TYPE, OCTET_STREAM)], ciphertext).into_response())
}

/// Accept a parsed result
pub async fn submit(
    State(state): State<Arc<MasterState>>,
    Path(worker): Path<WorkerId>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let (session, plain) = state.open(&worker, &body)?;
    let record: ResultRecord = parse_body(&plain)?;
    let id = record.item_id()?;

    state.queue.acknowledge(id).await;
    if !session.first_submission(id) {
        debug!(%worker, %id, "Ignoring repeated result submission");
        return Ok(StatusCode::OK);
    }
    state.metrics.results_submitted.inc();
    if let Some(created) = id_timestamp(&id) {
        let latency = (Utc::now() - created).num_milliseconds().max(0) as f64 / 1000.0;
        state.metrics.item_latency.observe(latency);
    }
    debug!(%worker, %id, "Result submitted");

    let sink = state.sink.clone();
    tokio::spawn(async move {
        if let Err(e) = sink.write(&record).await {
            error!(uid = %record.uid, error = %e, "Failed to write result");
        }
    });

    Ok(StatusCode::OK)
}

/// Release an item without a result
pub async fn ack(
    State(state): State<Arc<MasterState>>,
    Path(worker): Path<WorkerId>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let (_, plain) = state.open(&worker, &body)?;
    let AckRequest { uid } = parse_body(&plain)?;
    let id = parse_uid(&uid)?;

    state.queue.acknowledge(id).await;
    state.metrics.items_acknowledged.inc();
    debug!(%worker, %id, "Item acknowledged without result");
    Ok(StatusCode::OK)
}

/// End the worker's session
pub async fn bye(
    State(state): State<Arc<MasterState>>,
    Path(worker): Path<WorkerId>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let (session, plain) = state.open(&worker, &body)?;
    let Sequenced { request_id } = parse_body(&plain)?;
    state.check_sequence(&worker, &session, request_id).await?;

    state.end_session(&worker, &session);
    Ok(StatusCode::OK)
}
