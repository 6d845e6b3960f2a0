//! Durable event log
//!
//! Append-only log with consumer groups. Ingestion appends, fan-out reads
//! through a named group and acknowledges what it drained.

pub mod memory;
pub mod redis_stream;

pub use memory::MemoryEventLog;
pub use redis_stream::RedisStreamLog;

use anyhow::Result;
use std::time::Duration;

/// Field carrying the serialized event inside a log entry
pub const PAYLOAD_FIELD: &str = "data";

/// Where a group read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group
    New,
    /// Entries delivered to this consumer but not yet acknowledged
    Pending,
}

impl ReadCursor {
    /// Redis stream id argument for XREADGROUP
    pub fn as_stream_id(&self) -> &'static str {
        match self {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        }
    }
}

/// One drained entry. `payload` is absent when the entry has no `data` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: String,
    pub payload: Option<String>,
}

impl LogEntry {
    pub fn new(id: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append one serialized event, trimming the log to roughly `max_len` entries.
    async fn append(&self, payload: &str, max_len: usize) -> Result<String>;

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, group: &str) -> Result<()>;

    /// Read up to `count` entries for `consumer`, waiting at most `block` when
    /// nothing is available. `block` of zero means do not wait.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Take over up to `count` entries that sat unacknowledged in any consumer's
    /// pending list for at least `min_idle`. Claimed entries become pending for
    /// `consumer`; entries trimmed from the log are dropped instead.
    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge drained entries; returns how many were still pending.
    async fn ack(&self, group: &str, ids: &[String]) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}
