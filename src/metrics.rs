//! Pipeline Metrics
//!
//! One aggregate of relaxed atomic counters shared by every component through
//! an `Arc<PipelineMetrics>` handle. Exposed as a log summary line, a
//! serializable snapshot and Prometheus text.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // Feed
    pub connect_attempts: AtomicU64,
    pub connect_successes: AtomicU64,
    pub disconnects: AtomicU64,
    pub subscriptions_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub non_data_frames: AtomicU64,
    pub frame_parse_errors: AtomicU64,
    pub admission_rejects: AtomicU64,
    pub events_normalized: AtomicU64,
    pub events_appended: AtomicU64,
    pub append_errors: AtomicU64,

    // Throttle
    pub throttle_admitted: AtomicU64,
    pub throttled: AtomicU64,
    pub first_sightings: AtomicU64,
    pub window_resets: AtomicU64,
    pub type_flips: AtomicU64,
    pub path_changes: AtomicU64,
    pub long_path_admits: AtomicU64,
    pub transit_admits: AtomicU64,
    pub filtered_out: AtomicU64,
    pub state_evictions: AtomicU64,
    pub tracked_prefixes: AtomicU64,

    // Geo
    pub geo_lookups: AtomicU64,
    pub geo_table_hits: AtomicU64,
    pub geo_db_hits: AtomicU64,
    pub geo_fallbacks: AtomicU64,

    // Fanout
    pub fanout_polls: AtomicU64,
    pub entries_drained: AtomicU64,
    pub entry_parse_failures: AtomicU64,
    pub batches_broadcast: AtomicU64,
    pub frames_queued: AtomicU64,
    pub send_failures: AtomicU64,
    pub subscribers_connected: AtomicU64,
    pub subscribers_removed: AtomicU64,
    pub entries_acked: AtomicU64,
    pub ack_errors: AtomicU64,
    pub entries_reclaimed: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ===== Feed =====

    #[inline]
    pub fn record_connect_attempt(&self) {
        bump(&self.connect_attempts);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        bump(&self.connect_successes);
    }

    #[inline]
    pub fn record_disconnect(&self) {
        bump(&self.disconnects);
    }

    #[inline]
    pub fn record_subscription_sent(&self) {
        bump(&self.subscriptions_sent);
    }

    #[inline]
    pub fn record_frame_received(&self) {
        bump(&self.frames_received);
    }

    #[inline]
    pub fn record_non_data_frame(&self) {
        bump(&self.non_data_frames);
    }

    #[inline]
    pub fn record_frame_parse_error(&self) {
        bump(&self.frame_parse_errors);
    }

    #[inline]
    pub fn record_admission_reject(&self) {
        bump(&self.admission_rejects);
    }

    #[inline]
    pub fn record_events_normalized(&self, n: usize) {
        add(&self.events_normalized, n as u64);
    }

    #[inline]
    pub fn record_event_appended(&self) {
        bump(&self.events_appended);
    }

    #[inline]
    pub fn record_append_error(&self) {
        bump(&self.append_errors);
    }

    // ===== Throttle =====

    #[inline]
    pub fn record_admitted(&self) {
        bump(&self.throttle_admitted);
    }

    #[inline]
    pub fn record_throttled(&self) {
        bump(&self.throttled);
    }

    #[inline]
    pub fn record_first_sighting(&self) {
        bump(&self.first_sightings);
    }

    #[inline]
    pub fn record_window_reset(&self) {
        bump(&self.window_resets);
    }

    #[inline]
    pub fn record_type_flip(&self) {
        bump(&self.type_flips);
    }

    #[inline]
    pub fn record_path_change(&self) {
        bump(&self.path_changes);
    }

    #[inline]
    pub fn record_long_path_admit(&self) {
        bump(&self.long_path_admits);
    }

    #[inline]
    pub fn record_transit_admit(&self) {
        bump(&self.transit_admits);
    }

    #[inline]
    pub fn record_filtered_out(&self) {
        bump(&self.filtered_out);
    }

    #[inline]
    pub fn record_evictions(&self, n: usize) {
        add(&self.state_evictions, n as u64);
    }

    #[inline]
    pub fn set_tracked_prefixes(&self, n: usize) {
        self.tracked_prefixes.store(n as u64, Ordering::Relaxed);
    }

    // ===== Geo =====

    #[inline]
    pub fn record_geo_lookup(&self) {
        bump(&self.geo_lookups);
    }

    #[inline]
    pub fn record_geo_table_hit(&self) {
        bump(&self.geo_table_hits);
    }

    #[inline]
    pub fn record_geo_db_hit(&self) {
        bump(&self.geo_db_hits);
    }

    #[inline]
    pub fn record_geo_fallback(&self) {
        bump(&self.geo_fallbacks);
    }

    // ===== Fanout =====

    #[inline]
    pub fn record_poll(&self) {
        bump(&self.fanout_polls);
    }

    #[inline]
    pub fn record_entries_drained(&self, n: usize) {
        add(&self.entries_drained, n as u64);
    }

    #[inline]
    pub fn record_entry_parse_failure(&self) {
        bump(&self.entry_parse_failures);
    }

    #[inline]
    pub fn record_batch_broadcast(&self) {
        bump(&self.batches_broadcast);
    }

    #[inline]
    pub fn record_frames_queued(&self, n: usize) {
        add(&self.frames_queued, n as u64);
    }

    #[inline]
    pub fn record_send_failures(&self, n: usize) {
        add(&self.send_failures, n as u64);
    }

    #[inline]
    pub fn set_subscribers_connected(&self, n: usize) {
        self.subscribers_connected.store(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscribers_removed(&self, n: usize) {
        add(&self.subscribers_removed, n as u64);
    }

    #[inline]
    pub fn record_entries_acked(&self, n: u64) {
        add(&self.entries_acked, n);
    }

    #[inline]
    pub fn record_ack_error(&self) {
        bump(&self.ack_errors);
    }

    #[inline]
    pub fn record_entries_reclaimed(&self, n: usize) {
        add(&self.entries_reclaimed, n as u64);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: load(&self.connect_attempts),
            connect_successes: load(&self.connect_successes),
            disconnects: load(&self.disconnects),
            subscriptions_sent: load(&self.subscriptions_sent),
            frames_received: load(&self.frames_received),
            non_data_frames: load(&self.non_data_frames),
            frame_parse_errors: load(&self.frame_parse_errors),
            admission_rejects: load(&self.admission_rejects),
            events_normalized: load(&self.events_normalized),
            events_appended: load(&self.events_appended),
            append_errors: load(&self.append_errors),
            throttle_admitted: load(&self.throttle_admitted),
            throttled: load(&self.throttled),
            first_sightings: load(&self.first_sightings),
            window_resets: load(&self.window_resets),
            type_flips: load(&self.type_flips),
            path_changes: load(&self.path_changes),
            long_path_admits: load(&self.long_path_admits),
            transit_admits: load(&self.transit_admits),
            filtered_out: load(&self.filtered_out),
            state_evictions: load(&self.state_evictions),
            tracked_prefixes: load(&self.tracked_prefixes),
            geo_lookups: load(&self.geo_lookups),
            geo_table_hits: load(&self.geo_table_hits),
            geo_db_hits: load(&self.geo_db_hits),
            geo_fallbacks: load(&self.geo_fallbacks),
            fanout_polls: load(&self.fanout_polls),
            entries_drained: load(&self.entries_drained),
            entry_parse_failures: load(&self.entry_parse_failures),
            batches_broadcast: load(&self.batches_broadcast),
            frames_queued: load(&self.frames_queued),
            send_failures: load(&self.send_failures),
            subscribers_connected: load(&self.subscribers_connected),
            subscribers_removed: load(&self.subscribers_removed),
            entries_acked: load(&self.entries_acked),
            ack_errors: load(&self.ack_errors),
            entries_reclaimed: load(&self.entries_reclaimed),
        }
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "feed connects={}/{} frames={} rejected={} appended={} append_err={} | throttle admitted={} throttled={} flips={} path_changes={} tracked={} | geo lookups={} table={} db={} fallback={} | fanout drained={} bad={} batches={} subscribers={} removed={} acked={} reclaimed={}",
            s.connect_successes,
            s.connect_attempts,
            s.frames_received,
            s.admission_rejects,
            s.events_appended,
            s.append_errors,
            s.throttle_admitted,
            s.throttled,
            s.type_flips,
            s.path_changes,
            s.tracked_prefixes,
            s.geo_lookups,
            s.geo_table_hits,
            s.geo_db_hits,
            s.geo_fallbacks,
            s.entries_drained,
            s.entry_parse_failures,
            s.batches_broadcast,
            s.subscribers_connected,
            s.subscribers_removed,
            s.entries_acked,
            s.entries_reclaimed,
        )
    }

    /// Export all metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        let counters: [(&str, &str, u64); 34] = [
            ("feed_connect_attempts_total", "Feed connection attempts", s.connect_attempts),
            ("feed_connect_successes_total", "Feed connections established", s.connect_successes),
            ("feed_disconnects_total", "Feed connections lost", s.disconnects),
            ("feed_subscriptions_sent_total", "Subscription requests sent", s.subscriptions_sent),
            ("feed_frames_received_total", "Frames received from the feed", s.frames_received),
            ("feed_non_data_frames_total", "Control frames ignored", s.non_data_frames),
            ("feed_frame_parse_errors_total", "Frames that failed to parse", s.frame_parse_errors),
            ("feed_admission_rejects_total", "Messages dropped by the admission filter", s.admission_rejects),
            ("feed_events_normalized_total", "Per-prefix events produced", s.events_normalized),
            ("feed_events_appended_total", "Events appended to the log", s.events_appended),
            ("feed_append_errors_total", "Log append failures", s.append_errors),
            ("throttle_admitted_total", "Events admitted by the throttle", s.throttle_admitted),
            ("throttle_dropped_total", "Events dropped as duplicates", s.throttled),
            ("throttle_first_sightings_total", "Prefixes seen for the first time", s.first_sightings),
            ("throttle_window_resets_total", "Admits after the window elapsed", s.window_resets),
            ("throttle_type_flips_total", "Announce/withdraw flips", s.type_flips),
            ("throttle_path_changes_total", "AS path changes", s.path_changes),
            ("throttle_long_path_admits_total", "Admits due to path length", s.long_path_admits),
            ("throttle_transit_admits_total", "Admits due to major-transit hops", s.transit_admits),
            ("throttle_filtered_out_total", "Events dropped by the allow-set filter", s.filtered_out),
            ("throttle_state_evictions_total", "Idle prefix states evicted", s.state_evictions),
            ("geo_lookups_total", "Geo resolutions", s.geo_lookups),
            ("geo_table_hits_total", "Resolutions from the static table", s.geo_table_hits),
            ("geo_db_hits_total", "Resolutions from the address database", s.geo_db_hits),
            ("geo_fallbacks_total", "Resolutions from the hub fallback", s.geo_fallbacks),
            ("fanout_polls_total", "Log poll cycles", s.fanout_polls),
            ("fanout_entries_drained_total", "Log entries drained", s.entries_drained),
            ("fanout_entry_parse_failures_total", "Log entries that failed to parse", s.entry_parse_failures),
            ("fanout_batches_broadcast_total", "Batches broadcast", s.batches_broadcast),
            ("fanout_frames_queued_total", "Frames queued to subscribers", s.frames_queued),
            ("fanout_send_failures_total", "Subscriber send failures", s.send_failures),
            ("fanout_subscribers_removed_total", "Subscribers removed", s.subscribers_removed),
            ("fanout_entries_acked_total", "Log entries acknowledged", s.entries_acked),
            ("fanout_entries_reclaimed_total", "Stale pending entries taken over", s.entries_reclaimed),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP routewatch_{} {}\n", name, help));
            output.push_str(&format!("# TYPE routewatch_{} counter\n", name));
            output.push_str(&format!("routewatch_{} {}\n", name, value));
        }

        output.push_str("# HELP routewatch_fanout_ack_errors_total Acknowledgement failures\n");
        output.push_str("# TYPE routewatch_fanout_ack_errors_total counter\n");
        output.push_str(&format!("routewatch_fanout_ack_errors_total {}\n", s.ack_errors));

        output.push_str("# HELP routewatch_throttle_tracked_prefixes Prefixes with throttle state\n");
        output.push_str("# TYPE routewatch_throttle_tracked_prefixes gauge\n");
        output.push_str(&format!("routewatch_throttle_tracked_prefixes {}\n", s.tracked_prefixes));

        output.push_str("# HELP routewatch_fanout_subscribers Live subscriber connections\n");
        output.push_str("# TYPE routewatch_fanout_subscribers gauge\n");
        output.push_str(&format!("routewatch_fanout_subscribers {}\n", s.subscribers_connected));

        output
    }
}

/// Plain copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub disconnects: u64,
    pub subscriptions_sent: u64,
    pub frames_received: u64,
    pub non_data_frames: u64,
    pub frame_parse_errors: u64,
    pub admission_rejects: u64,
    pub events_normalized: u64,
    pub events_appended: u64,
    pub append_errors: u64,
    pub throttle_admitted: u64,
    pub throttled: u64,
    pub first_sightings: u64,
    pub window_resets: u64,
    pub type_flips: u64,
    pub path_changes: u64,
    pub long_path_admits: u64,
    pub transit_admits: u64,
    pub filtered_out: u64,
    pub state_evictions: u64,
    pub tracked_prefixes: u64,
    pub geo_lookups: u64,
    pub geo_table_hits: u64,
    pub geo_db_hits: u64,
    pub geo_fallbacks: u64,
    pub fanout_polls: u64,
    pub entries_drained: u64,
    pub entry_parse_failures: u64,
    pub batches_broadcast: u64,
    pub frames_queued: u64,
    pub send_failures: u64,
    pub subscribers_connected: u64,
    pub subscribers_removed: u64,
    pub entries_acked: u64,
    pub ack_errors: u64,
    pub entries_reclaimed: u64,
}

/// Log the summary line on a fixed interval until the process stops
pub async fn run_reporter(metrics: Arc<PipelineMetrics>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately; skip it so the first report covers a full period.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        info!(metrics = %metrics.summary(), "pipeline_metrics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = PipelineMetrics::new();
        metrics.record_throttled();
        metrics.record_throttled();
        metrics.record_type_flip();
        metrics.record_entries_drained(50);
        metrics.record_entries_acked(50);
        metrics.set_subscribers_connected(2);
        metrics.set_subscribers_connected(1);

        let s = metrics.snapshot();
        assert_eq!(s.throttled, 2);
        assert_eq!(s.type_flips, 1);
        assert_eq!(s.entries_drained, 50);
        assert_eq!(s.entries_acked, 50);
        assert_eq!(s.subscribers_connected, 1);
        assert_eq!(s.path_changes, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = PipelineMetrics::new();
        metrics.record_geo_fallback();
        metrics.set_tracked_prefixes(12);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE routewatch_geo_fallbacks_total counter"));
        assert!(text.contains("routewatch_geo_fallbacks_total 1\n"));
        assert!(text.contains("routewatch_throttle_tracked_prefixes 12\n"));
        assert!(text.contains("# TYPE routewatch_fanout_subscribers gauge"));
    }

    #[test]
    fn test_summary_mentions_components() {
        let metrics = PipelineMetrics::new();
        let line = metrics.summary();
        assert!(line.starts_with("feed connects=0/0"));
        assert!(line.contains("| throttle "));
        assert!(line.contains("| fanout "));
    }
}
