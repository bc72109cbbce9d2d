//! Authorization cache and its durable log

pub mod cache;
pub mod log;

pub use cache::{AuthorizationCache, AuthorizationOutcome, AuthorizationResult};
pub use log::{apply_records, AuthorizationLog, LogOperation, LogParseError, LogRecord, Replay};
