//! MailSift API - Master RPC server
//!
//! This crate exposes one work queue to many remote workers over an
//! authenticated, encrypted and replay-protected HTTP API.

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use metrics::MasterMetrics;
pub use routes::create_router;
pub use state::MasterState;
