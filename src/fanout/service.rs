//! Stream Fan-out
//!
//! Poll the consumer group, batch what was drained into one frame, enqueue it
//! for every live subscriber, then acknowledge everything drained. Acks are
//! unconditional so the group cursor keeps moving even with no viewers; a
//! failed ack is retried before the next read. Entries another consumer left
//! pending past the idle threshold are claimed and delivered here.

use super::subscribers::{Frame, SubscriberSet};
use crate::config::FanoutConfig;
use crate::eventlog::{EventLog, LogEntry, ReadCursor};
use crate::metrics::PipelineMetrics;
use crate::models::{Event, ParseOutcome, RejectReason, ServerFrame};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Retry delay after a failed read
const READ_RETRY: Duration = Duration::from_secs(1);
const IDLE_SPIN: Duration = Duration::from_millis(10);
const MIN_RECLAIM_EVERY: Duration = Duration::from_secs(1);

/// Result of one poll cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub drained: usize,
    pub parse_failures: usize,
    pub broadcast_items: usize,
    pub delivered: usize,
    pub removed: usize,
    pub acked: u64,
    pub acked_ids: Vec<String>,
    /// Entries from earlier cycles whose ack went through on retry
    pub retried_acks: u64,
}

/// Log entry payload → event
pub fn parse_entry(entry: &LogEntry) -> ParseOutcome<Event> {
    match entry.payload.as_deref() {
        None => ParseOutcome::Rejected(RejectReason::MissingPayload),
        Some(raw) => Event::from_json(raw).into(),
    }
}

pub struct StreamFanout {
    log: Arc<dyn EventLog>,
    subscribers: SubscriberSet,
    cfg: FanoutConfig,
    metrics: Arc<PipelineMetrics>,
    /// Ids whose ack failed
    unacked: Mutex<Vec<String>>,
}

impl StreamFanout {
    pub fn new(
        log: Arc<dyn EventLog>,
        subscribers: SubscriberSet,
        cfg: FanoutConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            log,
            subscribers,
            cfg,
            metrics,
            unacked: Mutex::new(Vec::new()),
        }
    }

    fn read_count(&self) -> usize {
        if self.cfg.immediate_mode() {
            1
        } else {
            self.cfg.read_count
        }
    }

    /// Ids still waiting for a successful ack
    pub fn unacked_len(&self) -> usize {
        self.unacked.lock().len()
    }

    /// Retry acks, then drain, parse, broadcast, acknowledge, prune. Only the read can fail.
    pub async fn poll_once(&self, cursor: ReadCursor) -> Result<CycleReport> {
        self.metrics.record_poll();
        let retried_acks = self.retry_unacked().await;

        let entries = self
            .log
            .read_group(
                &self.cfg.group,
                &self.cfg.consumer,
                cursor,
                self.read_count(),
                self.cfg.block(),
            )
            .await
            .context("consumer group read failed")?;

        let mut report = self.deliver(entries).await;
        report.retried_acks = retried_acks;
        Ok(report)
    }

    async fn retry_unacked(&self) -> u64 {
        let ids = std::mem::take(&mut *self.unacked.lock());
        if ids.is_empty() {
            return 0;
        }

        match self.log.ack(&self.cfg.group, &ids).await {
            Ok(acked) => {
                self.metrics.record_entries_acked(acked);
                info!(entries = ids.len(), acked, "log_ack_retried");
                acked
            }
            Err(e) => {
                self.metrics.record_ack_error();
                warn!(entries = ids.len(), error = %e, "log_ack_retry_failed");
                self.unacked.lock().extend(ids);
                0
            }
        }
    }

    async fn deliver(&self, entries: Vec<LogEntry>) -> CycleReport {
        let mut report = CycleReport {
            drained: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return report;
        }
        self.metrics.record_entries_drained(entries.len());

        let mut items = Vec::with_capacity(entries.len());
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_entry(&entry) {
                ParseOutcome::Parsed(event) => items.push(event),
                ParseOutcome::Rejected(reason) => {
                    report.parse_failures += 1;
                    self.metrics.record_entry_parse_failure();
                    warn!(id = %entry.id, reason = %reason, "log_entry_rejected");
                }
            }
            ids.push(entry.id);
        }

        let mut failed = Vec::new();
        if !items.is_empty() && !self.subscribers.is_empty() {
            report.broadcast_items = items.len();
            match serde_json::to_string(&ServerFrame::Bgp { items }) {
                Ok(json) => {
                    let frame: Frame = Arc::from(json);
                    let sent = self.subscribers.broadcast(frame);
                    report.delivered = sent.delivered;
                    self.metrics.record_batch_broadcast();
                    self.metrics.record_frames_queued(sent.delivered);
                    self.metrics.record_send_failures(sent.failed.len());
                    failed = sent.failed;
                }
                Err(e) => warn!(error = %e, "batch_serialize_failed"),
            }
        }

        match self.log.ack(&self.cfg.group, &ids).await {
            Ok(acked) => {
                report.acked = acked;
                self.metrics.record_entries_acked(acked);
            }
            Err(e) => {
                self.metrics.record_ack_error();
                warn!(entries = ids.len(), error = %e, "log_ack_failed");
                self.unacked.lock().extend(ids.iter().cloned());
            }
        }
        report.acked_ids = ids;

        if !failed.is_empty() {
            report.removed = self.subscribers.remove_all(&failed);
            self.metrics.record_subscribers_removed(report.removed);
            info!(removed = report.removed, remaining = self.subscribers.len(), "subscribers_pruned");
        }
        self.metrics.set_subscribers_connected(self.subscribers.len());

        debug!(
            drained = report.drained,
            items = report.broadcast_items,
            delivered = report.delivered,
            acked = report.acked,
            "fanout_cycle"
        );
        report
    }

    /// Take over and deliver entries any consumer of the group left pending
    /// for longer than the idle threshold.
    pub async fn reclaim_stale(&self) -> usize {
        let mut reclaimed = 0;
        loop {
            let entries = match self
                .log
                .claim_stale(
                    &self.cfg.group,
                    &self.cfg.consumer,
                    self.cfg.claim_min_idle(),
                    self.cfg.read_count.max(1),
                )
                .await
            {
                Ok(entries) if entries.is_empty() => break,
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "stale_claim_failed");
                    break;
                }
            };

            let report = self.deliver(entries).await;
            reclaimed += report.drained;
            if report.acked == 0 {
                break;
            }
        }
        if reclaimed > 0 {
            self.metrics.record_entries_reclaimed(reclaimed);
            info!(reclaimed, "stale_entries_reclaimed");
        }
        reclaimed
    }

    /// Push entries delivered before a restart but never acknowledged: this
    /// consumer's own pending list first, then stale entries of other consumers.
    pub async fn recover_pending(&self) -> usize {
        let mut recovered = 0;
        loop {
            match self.poll_once(ReadCursor::Pending).await {
                Ok(report) if report.drained == 0 => break,
                Ok(report) => {
                    recovered += report.drained;
                    // Nothing acknowledged means the same entries would come back
                    if report.acked == 0 {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pending_recovery_failed");
                    break;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "pending_entries_recovered");
        }
        recovered + self.reclaim_stale().await
    }

    fn reclaim_every(&self) -> Duration {
        self.cfg.claim_min_idle().max(MIN_RECLAIM_EVERY)
    }

    async fn reclaim_if_due(&self, next_reclaim: &mut Instant) {
        if Instant::now() >= *next_reclaim {
            self.reclaim_stale().await;
            *next_reclaim = Instant::now() + self.reclaim_every();
        }
    }

    pub async fn run(self) {
        info!(
            group = %self.cfg.group,
            consumer = %self.cfg.consumer,
            batch_ms = self.cfg.batch_ms,
            claim_min_idle_ms = self.cfg.claim_min_idle_ms,
            "stream_fanout_started"
        );

        self.recover_pending().await;
        let mut next_reclaim = Instant::now() + self.reclaim_every();

        if self.cfg.immediate_mode() {
            loop {
                self.reclaim_if_due(&mut next_reclaim).await;
                match self.poll_once(ReadCursor::New).await {
                    // Without a blocking read an empty log would spin
                    Ok(report) if report.drained == 0 && self.cfg.block().is_zero() => {
                        sleep(IDLE_SPIN).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "fanout_poll_failed");
                        sleep(READ_RETRY).await;
                    }
                }
            }
        }

        let mut ticker = interval(self.cfg.batch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.reclaim_if_due(&mut next_reclaim).await;
            if let Err(e) = self.poll_once(ReadCursor::New).await {
                warn!(error = %e, "fanout_poll_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::MemoryEventLog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GROUP: &str = "fanout";

    async fn setup(batch_ms: u64) -> (StreamFanout, Arc<MemoryEventLog>, SubscriberSet, Arc<PipelineMetrics>) {
        let log = Arc::new(MemoryEventLog::new());
        log.ensure_group(GROUP).await.unwrap();
        let subscribers = SubscriberSet::new();
        let metrics = PipelineMetrics::shared();
        let cfg = FanoutConfig {
            group: GROUP.to_string(),
            consumer: "fanout-test".to_string(),
            batch_ms,
            block_ms: 0,
            ..FanoutConfig::default()
        };
        let fanout = StreamFanout::new(log.clone(), subscribers.clone(), cfg, metrics.clone());
        (fanout, log, subscribers, metrics)
    }

    fn event_json(i: usize) -> String {
        Event::announce(i as f64, format!("10.{}.0.0/16", i), 64500, 3333, vec![3333, 64500])
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn test_batch_with_failures_and_dead_subscriber() {
        let (fanout, log, subscribers, metrics) = setup(1000).await;
        for i in 0..50 {
            let payload = if i % 17 == 5 { "{broken".to_string() } else { event_json(i) };
            log.append(&payload, 1000).await.unwrap();
        }

        let (live, mut live_rx) = subscribers.register(8);
        let (dead, dead_rx) = subscribers.register(8);
        drop(dead_rx);

        let report = fanout.poll_once(ReadCursor::New).await.unwrap();
        assert_eq!(report.drained, 50);
        assert_eq!(report.parse_failures, 3);
        assert_eq!(report.broadcast_items, 47);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.acked, 50);
        assert_eq!(report.acked_ids.len(), 50);
        assert_eq!(report.removed, 1);

        assert!(subscribers.contains(live));
        assert!(!subscribers.contains(dead));
        assert_eq!(log.pending_count(GROUP), 0);

        let frame = live_rx.recv().await.unwrap();
        let parsed: ServerFrame = serde_json::from_str(&frame).unwrap();
        match parsed {
            ServerFrame::Bgp { items } => assert_eq!(items.len(), 47),
            other => panic!("Expected bgp batch, got {:?}", other),
        }

        let s = metrics.snapshot();
        assert_eq!(s.entries_acked, 50);
        assert_eq!(s.entry_parse_failures, 3);
        assert_eq!(s.subscribers_removed, 1);
        assert_eq!(s.subscribers_connected, 1);
    }

    #[tokio::test]
    async fn test_ack_without_subscribers() {
        let (fanout, log, _, _) = setup(1000).await;
        for i in 0..5 {
            log.append(&event_json(i), 1000).await.unwrap();
        }

        let report = fanout.poll_once(ReadCursor::New).await.unwrap();
        assert_eq!(report.drained, 5);
        assert_eq!(report.broadcast_items, 0);
        assert_eq!(report.acked, 5);
        assert_eq!(log.pending_count(GROUP), 0);
    }

    #[tokio::test]
    async fn test_all_entries_unparsable_still_acked() {
        let (fanout, log, subscribers, _) = setup(1000).await;
        let (_id, mut rx) = subscribers.register(4);
        log.append("nope", 1000).await.unwrap();

        let report = fanout.poll_once(ReadCursor::New).await.unwrap();
        assert_eq!(report.acked, 1);
        assert_eq!(report.broadcast_items, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_poll() {
        let (fanout, _, _, _) = setup(1000).await;
        let report = fanout.poll_once(ReadCursor::New).await.unwrap();
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn test_immediate_mode_reads_one() {
        let (fanout, log, _, _) = setup(0).await;
        for i in 0..3 {
            log.append(&event_json(i), 1000).await.unwrap();
        }
        let report = fanout.poll_once(ReadCursor::New).await.unwrap();
        assert_eq!(report.drained, 1);
    }

    #[tokio::test]
    async fn test_pending_recovery() {
        let (fanout, log, _, _) = setup(1000).await;
        for i in 0..4 {
            log.append(&event_json(i), 1000).await.unwrap();
        }
        // Delivered to this consumer by a previous run, never acknowledged
        log.read_group(GROUP, "fanout-test", ReadCursor::New, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(log.pending_count(GROUP), 4);

        assert_eq!(fanout.recover_pending().await, 4);
        assert_eq!(log.pending_count(GROUP), 0);
    }

    /// Memory log whose next `fail_acks` acks fail
    struct FlakyAckLog {
        inner: MemoryEventLog,
        fail_acks: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventLog for FlakyAckLog {
        async fn append(&self, payload: &str, max_len: usize) -> Result<String> {
            self.inner.append(payload, max_len).await
        }
        async fn ensure_group(&self, group: &str) -> Result<()> {
            self.inner.ensure_group(group).await
        }
        async fn read_group(
            &self,
            group: &str,
            consumer: &str,
            cursor: ReadCursor,
            count: usize,
            block: Duration,
        ) -> Result<Vec<LogEntry>> {
            self.inner.read_group(group, consumer, cursor, count, block).await
        }
        async fn claim_stale(
            &self,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            count: usize,
        ) -> Result<Vec<LogEntry>> {
            self.inner.claim_stale(group, consumer, min_idle, count).await
        }
        async fn ack(&self, group: &str, ids: &[String]) -> Result<u64> {
            let failing = self
                .fail_acks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                anyhow::bail!("connection reset");
            }
            self.inner.ack(group, ids).await
        }
        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_failed_ack_retried_next_cycle() {
        let log = Arc::new(FlakyAckLog {
            inner: MemoryEventLog::new(),
            fail_acks: AtomicUsize::new(1),
        });
        log.ensure_group(GROUP).await.unwrap();
        let metrics = PipelineMetrics::shared();
        let cfg = FanoutConfig {
            group: GROUP.to_string(),
            consumer: "fanout-test".to_string(),
            block_ms: 0,
            ..FanoutConfig::default()
        };
        let fanout = StreamFanout::new(log.clone(), SubscriberSet::new(), cfg, metrics.clone());
        for i in 0..5 {
            log.append(&event_json(i), 1000).await.unwrap();
        }

        let first = fanout.poll_once(ReadCursor::New).await.unwrap();
        assert_eq!(first.drained, 5);
        assert_eq!(first.acked, 0);
        assert_eq!(fanout.unacked_len(), 5);
        assert_eq!(log.inner.pending_count(GROUP), 5);

        let second = fanout.poll_once(ReadCursor::New).await.unwrap();
        assert_eq!(second.drained, 0);
        assert_eq!(second.retried_acks, 5);
        assert_eq!(fanout.unacked_len(), 0);
        assert_eq!(log.inner.pending_count(GROUP), 0);

        let s = metrics.snapshot();
        assert_eq!(s.ack_errors, 1);
        assert_eq!(s.entries_acked, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reclaims_entries_of_previous_consumer() {
        let log = Arc::new(MemoryEventLog::new());
        log.ensure_group(GROUP).await.unwrap();
        for i in 0..4 {
            log.append(&event_json(i), 1000).await.unwrap();
        }
        // Drained by a process that died before acknowledging
        log.read_group(GROUP, "fanout-crashed", ReadCursor::New, 10, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let metrics = PipelineMetrics::shared();
        let subscribers = SubscriberSet::new();
        let (_id, mut rx) = subscribers.register(8);
        let cfg = FanoutConfig::default();
        assert_eq!(cfg.group, GROUP);
        let fanout = StreamFanout::new(log.clone(), subscribers, cfg, metrics.clone());

        assert_eq!(fanout.recover_pending().await, 4);
        assert_eq!(log.pending_count(GROUP), 0);
        assert_eq!(metrics.snapshot().entries_reclaimed, 4);

        let frame = rx.recv().await.unwrap();
        match serde_json::from_str::<ServerFrame>(&frame).unwrap() {
            ServerFrame::Bgp { items } => assert_eq!(items.len(), 4),
            other => panic!("Expected bgp batch, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_leaves_recent_pending_alone() {
        let (fanout, log, _, _) = setup(1000).await;
        log.append(&event_json(1), 1000).await.unwrap();
        log.read_group(GROUP, "fanout-busy", ReadCursor::New, 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(fanout.reclaim_stale().await, 0);
        assert_eq!(log.pending_count(GROUP), 1);
    }
}
