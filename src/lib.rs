//! RouteWatch Backend Library
//!
//! BGP update ingestion and live fan-out. Exposes every component so the
//! binary and the integration tests wire them the same way.

pub mod api;
pub mod config;
pub mod eventlog;
pub mod fanout;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod pipeline;

pub use config::{AppConfig, RunMode};
pub use eventlog::{EventLog, MemoryEventLog, ReadCursor, RedisStreamLog};
pub use metrics::PipelineMetrics;
pub use models::{Event, EventKind, ParseOutcome, RejectReason};
