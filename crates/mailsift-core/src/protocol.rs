//! Master/worker RPC message bodies
//!
//! `init` and `auth` travel as plain JSON with base64 fields. Every other
//! body is JSON (or MessagePack for work items) encrypted under the session
//! key and sent as `application/octet-stream`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Worker's SPAKE2 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub pake: String,
}

/// Master's SPAKE2 reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    pub hk: String,
}

/// Worker's key confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub hk: String,
}

/// Body of the sequenced `work` and `bye` calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequenced {
    pub request_id: u64,
}

/// Body of `ack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub uid: String,
}

/// Status page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub backend: String,
    pub sessions: usize,
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}
