//! MailSift Common - Shared types and utilities
//!
//! This crate provides the work item and result record types, configuration,
//! error types and the session encryption primitive shared by every MailSift
//! component.

pub mod config;
pub mod crypto;
pub mod error;
pub mod types;

pub use config::Config;
pub use crypto::{decrypt, encrypt, CryptoError, SessionKey};
pub use error::{Error, Result};
pub use types::{Origin, ResultRecord, WorkItem, WorkItemId, WorkerId};
