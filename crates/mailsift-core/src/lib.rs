//! MailSift Core - Worker pipeline and handshake
//!
//! This crate provides the SPAKE2 handshake used by master and workers, the
//! remote worker client, the parser and result sink seams with their default
//! implementations, and directory ingestion.

pub mod error;
pub mod ingest;
pub mod pake;
pub mod parser;
pub mod protocol;
pub mod sink;
pub mod worker;

pub use error::{ParseError, WorkerError};
pub use ingest::DirectoryIngest;
pub use pake::{PakeError, WorkerHandshake};
pub use parser::{HeaderParser, Parser};
pub use sink::{JsonLinesSink, ResultSink};
pub use worker::{MasterClient, Worker, WorkerState};
