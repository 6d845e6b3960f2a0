//! Service Configuration
//!
//! Environment-driven, every key optional. Unset or unparsable values keep
//! their defaults.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_FEED_URL: &str = "wss://ris-live.ripe.net/v1/ws/?client=routewatch";

/// Collectors subscribed by default, one subscription each
pub const DEFAULT_FEED_SOURCES: &[&str] = &[
    "rrc00", "rrc01", "rrc03", "rrc04", "rrc05", "rrc06", "rrc07", "rrc10", "rrc11", "rrc12",
    "rrc13", "rrc14", "rrc15", "rrc16", "rrc18", "rrc19", "rrc20", "rrc21", "rrc22", "rrc23",
    "rrc24", "rrc25", "rrc26",
];

/// Which pipeline halves run in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Feed ingestion and fan-out together
    All,
    /// Feed ingestion only
    Ingest,
    /// Fan-out and subscriber endpoint only
    Gateway,
}

impl RunMode {
    pub fn runs_ingest(&self) -> bool {
        matches!(self, RunMode::All | RunMode::Ingest)
    }

    pub fn runs_fanout(&self) -> bool {
        matches!(self, RunMode::All | RunMode::Gateway)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::All => write!(f, "all"),
            RunMode::Ingest => write!(f, "ingest"),
            RunMode::Gateway => write!(f, "gateway"),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Durable log address
    pub redis_url: String,
    /// Log/stream name
    pub stream_key: String,
    pub listen_port: u16,
    /// CORS origins for the subscriber endpoint; `*` allows any
    pub allowed_origins: Vec<String>,
    pub metrics_report_secs: u64,
    pub feed: FeedConfig,
    pub throttle: ThrottleConfig,
    pub fanout: FanoutConfig,
    pub geo: GeoConfig,
}

/// External feed connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub sources: Vec<String>,
    pub backoff_ms: u64,
    pub subscribe_stagger_ms: u64,
    pub connect_timeout_ms: u64,
    /// Approximate trim threshold passed with every append
    pub stream_maxlen: usize,
}

/// Duplicate suppression and the optional allow-set stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub window_ms: u64,
    pub idle_secs: u64,
    pub sweep_secs: u64,
    pub filter_enabled: bool,
    pub filter_asns: Vec<u32>,
}

/// Consumer-group reader and subscriber delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    pub group: String,
    pub consumer: String,
    /// Batching interval; 0 reads and broadcasts one entry at a time
    pub batch_ms: u64,
    pub read_count: usize,
    pub block_ms: u64,
    pub ping_secs: u64,
    pub subscriber_queue: usize,
    /// Pending entries idle this long are taken over from their consumer
    pub claim_min_idle_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoConfig {
    /// MaxMind City database
    pub db_path: Option<String>,
    /// JSON entity table merged over the built-in one
    pub table_path: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            sources: DEFAULT_FEED_SOURCES.iter().map(|s| s.to_string()).collect(),
            backoff_ms: 5000,
            subscribe_stagger_ms: 200,
            connect_timeout_ms: 10_000,
            stream_maxlen: 100_000,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: 500,
            idle_secs: 60,
            sweep_secs: 10,
            filter_enabled: false,
            filter_asns: Vec::new(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            group: "fanout".to_string(),
            consumer: format!("fanout-{}", uuid::Uuid::new_v4()),
            batch_ms: 1000,
            read_count: 500,
            block_ms: 1000,
            ping_secs: 30,
            subscriber_queue: 64,
            claim_min_idle_ms: 30_000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            stream_key: "events.bgp".to_string(),
            listen_port: 8080,
            allowed_origins: vec!["*".to_string()],
            metrics_report_secs: 30,
            feed: FeedConfig::default(),
            throttle: ThrottleConfig::default(),
            fanout: FanoutConfig::default(),
            geo: GeoConfig::default(),
        }
    }
}

impl FeedConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn subscribe_stagger(&self) -> Duration {
        Duration::from_millis(self.subscribe_stagger_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn sweep_every(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }
}

impl FanoutConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_ms)
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_secs)
    }

    pub fn immediate_mode(&self) -> bool {
        self.batch_ms == 0
    }

    pub fn claim_min_idle(&self) -> Duration {
        Duration::from_millis(self.claim_min_idle_ms)
    }
}

impl AppConfig {
    /// Read the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Some(v) = get("STREAM_KEY") {
            cfg.stream_key = v;
        }
        if let Some(v) = get("CONSUMER_GROUP") {
            cfg.fanout.group = v;
        }
        if let Some(v) = get("CONSUMER_NAME") {
            cfg.fanout.consumer = v;
        }
        parse_into(&get, "WS_BATCH_MS", &mut cfg.fanout.batch_ms);
        parse_into(&get, "READ_COUNT", &mut cfg.fanout.read_count);
        parse_into(&get, "BLOCK_MS", &mut cfg.fanout.block_ms);
        parse_into(&get, "WS_PING_SECS", &mut cfg.fanout.ping_secs);
        parse_into(&get, "SUBSCRIBER_QUEUE", &mut cfg.fanout.subscriber_queue);
        parse_into(&get, "CLAIM_MIN_IDLE_MS", &mut cfg.fanout.claim_min_idle_ms);

        parse_into(&get, "THROTTLE_WINDOW_MS", &mut cfg.throttle.window_ms);
        parse_into(&get, "THROTTLE_IDLE_SECS", &mut cfg.throttle.idle_secs);
        parse_into(&get, "THROTTLE_SWEEP_SECS", &mut cfg.throttle.sweep_secs);
        if let Some(v) = get("FILTER_ENABLED") {
            cfg.throttle.filter_enabled = parse_flag(&v);
        }
        if let Some(v) = get("FILTER_ASNS") {
            cfg.throttle.filter_asns = split_list(&v)
                .into_iter()
                .filter_map(|s| s.trim_start_matches("AS").parse().ok())
                .collect();
        }

        parse_into(&get, "STREAM_MAXLEN", &mut cfg.feed.stream_maxlen);
        if let Some(v) = get("FEED_URL") {
            cfg.feed.url = v;
        }
        if let Some(v) = lookup("FEED_SOURCES") {
            cfg.feed.sources = split_list(&v);
        }
        parse_into(&get, "FEED_BACKOFF_MS", &mut cfg.feed.backoff_ms);
        parse_into(&get, "FEED_SUBSCRIBE_STAGGER_MS", &mut cfg.feed.subscribe_stagger_ms);
        parse_into(&get, "FEED_CONNECT_TIMEOUT_MS", &mut cfg.feed.connect_timeout_ms);

        parse_into(&get, "LISTEN_PORT", &mut cfg.listen_port);
        if let Some(v) = get("ALLOWED_ORIGINS") {
            let origins = split_list(&v);
            if !origins.is_empty() {
                cfg.allowed_origins = origins;
            }
        }
        parse_into(&get, "METRICS_REPORT_SECS", &mut cfg.metrics_report_secs);

        cfg.geo.db_path = get("GEOIP_DB_PATH");
        cfg.geo.table_path = get("GEO_TABLE_PATH");

        // Zero would stall reads, queues or timers
        cfg.fanout.read_count = cfg.fanout.read_count.max(1);
        cfg.fanout.subscriber_queue = cfg.fanout.subscriber_queue.max(1);
        cfg.fanout.ping_secs = cfg.fanout.ping_secs.max(1);
        cfg.metrics_report_secs = cfg.metrics_report_secs.max(1);

        cfg
    }

    /// Startup checks that depend on which halves run
    pub fn validate(&self, mode: RunMode) -> Result<()> {
        if mode.runs_ingest() && self.feed.sources.is_empty() {
            bail!("FEED_SOURCES is empty; ingest needs at least one source channel");
        }
        if self.stream_key.is_empty() {
            bail!("STREAM_KEY must not be empty");
        }
        Ok(())
    }
}

fn parse_into<T, G>(get: &G, key: &str, slot: &mut T)
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(v) = get(key) {
        if let Ok(parsed) = v.trim().parse() {
            *slot = parsed;
        }
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = from_map(&[]);
        assert_eq!(cfg.redis_url, "redis://127.0.0.1:6379/0");
        assert_eq!(cfg.stream_key, "events.bgp");
        assert_eq!(cfg.fanout.group, "fanout");
        assert!(cfg.fanout.consumer.starts_with("fanout-"));
        assert_eq!(cfg.fanout.batch_ms, 1000);
        assert_eq!(cfg.fanout.read_count, 500);
        assert_eq!(cfg.throttle.window(), Duration::from_millis(500));
        assert_eq!(cfg.throttle.idle(), Duration::from_secs(60));
        assert!(!cfg.throttle.filter_enabled);
        assert_eq!(cfg.feed.stream_maxlen, 100_000);
        assert_eq!(cfg.feed.backoff(), Duration::from_secs(5));
        assert_eq!(cfg.feed.sources.len(), DEFAULT_FEED_SOURCES.len());
        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.allowed_origins, vec!["*"]);
        assert_eq!(cfg.fanout.claim_min_idle(), Duration::from_secs(30));
        assert!(cfg.geo.db_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let cfg = from_map(&[
            ("STREAM_KEY", "events.test"),
            ("CONSUMER_NAME", "fanout-a"),
            ("WS_BATCH_MS", "0"),
            ("THROTTLE_WINDOW_MS", "250"),
            ("FILTER_ENABLED", "TRUE"),
            ("FILTER_ASNS", "3333, AS1299,,bogus"),
            ("FEED_SOURCES", "rrc00,rrc21"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("GEOIP_DB_PATH", "/data/GeoLite2-City.mmdb"),
            ("CLAIM_MIN_IDLE_MS", "5000"),
        ]);

        assert_eq!(cfg.stream_key, "events.test");
        assert_eq!(cfg.fanout.consumer, "fanout-a");
        assert!(cfg.fanout.immediate_mode());
        assert_eq!(cfg.throttle.window_ms, 250);
        assert!(cfg.throttle.filter_enabled);
        assert_eq!(cfg.throttle.filter_asns, vec![3333, 1299]);
        assert_eq!(cfg.feed.sources, vec!["rrc00", "rrc21"]);
        assert_eq!(cfg.allowed_origins.len(), 2);
        assert_eq!(cfg.fanout.claim_min_idle_ms, 5000);
        assert_eq!(cfg.geo.db_path.as_deref(), Some("/data/GeoLite2-City.mmdb"));
    }

    #[test]
    fn test_unparsable_values_keep_defaults() {
        let cfg = from_map(&[("READ_COUNT", "many"), ("LISTEN_PORT", "99999")]);
        assert_eq!(cfg.fanout.read_count, 500);
        assert_eq!(cfg.listen_port, 8080);
    }

    #[test]
    fn test_clamps() {
        let cfg = from_map(&[
            ("READ_COUNT", "0"),
            ("SUBSCRIBER_QUEUE", "0"),
            ("WS_PING_SECS", "0"),
        ]);
        assert_eq!(cfg.fanout.read_count, 1);
        assert_eq!(cfg.fanout.subscriber_queue, 1);
        assert_eq!(cfg.fanout.ping_secs, 1);
    }

    #[test]
    fn test_validate_empty_sources() {
        let cfg = from_map(&[("FEED_SOURCES", " , ")]);
        assert!(cfg.feed.sources.is_empty());
        assert!(cfg.validate(RunMode::Ingest).is_err());
        assert!(cfg.validate(RunMode::All).is_err());
        assert!(cfg.validate(RunMode::Gateway).is_ok());
    }
}
