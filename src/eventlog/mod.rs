//! Event log client: connector/connection seams plus the SQLite-backed log.
//!
//! The consumer only talks to the log through [`Connector`] and
//! [`LogConnection`], so the retry controller and the consumption loop can be
//! driven by a scripted fake in tests.

pub mod history;
pub mod sqlite;

pub use self::history::{HistoryCounts, LogHistory};
pub use self::sqlite::{SqliteConnector, SqliteEventLog};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("event log unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("topic '{0}' does not exist on the event log")]
    TopicMissing(String),

    #[error("read from event log failed: {0}")]
    Read(String),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("gave up after {attempts} connection attempts")]
    Exhausted { attempts: u32 },
}

/// One undecoded message with its position in the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Factory for live connections. Each call yields a fresh connection that
/// resumes after the consumer group's committed offset.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn LogConnection>, ConnectionError>;

    /// Human-readable target, for logs.
    fn endpoint(&self) -> String;
}

/// An open consumer session on one topic for one consumer group.
#[async_trait]
pub trait LogConnection: Send {
    /// Next message after the read cursor, or `None` once `timeout` passes
    /// without one.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, ConnectionError>;

    /// Record `offset` as fully processed for the consumer group.
    async fn commit(&mut self, offset: u64) -> Result<(), ConnectionError>;

    /// Move the read cursor so the next poll returns `offset` again.
    fn seek(&mut self, offset: u64);
}
