//! Worker error types

use mailsift_common::CryptoError;
use thiserror::Error;

use crate::pake::PakeError;

/// Errors raised while talking to the master
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("master answered {0}")]
    Status(reqwest::StatusCode),

    /// The master refused the handshake or dropped the session
    #[error("rejected by master")]
    Unauthorized,

    #[error("no session established")]
    NoSession,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Handshake error: {0}")]
    Pake(#[from] PakeError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl From<mailsift_common::Error> for WorkerError {
    fn from(e: mailsift_common::Error) -> Self {
        WorkerError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for WorkerError {
    fn from(e: base64::DecodeError) -> Self {
        WorkerError::Serialization(format!("base64: {}", e))
    }
}

/// Parser failure for one work item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parse failed: {0}")]
pub struct ParseError(pub String);
