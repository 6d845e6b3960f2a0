//! Feed Ingestor
//!
//! Owns the feed session and the per-event pipeline. A single task receives
//! `FeedSignal`s from the connection task and timers, applies them to the
//! session state machine, and performs the resulting action. Frames are
//! processed one at a time so event order within a message is preserved from
//! normalization to append.

use super::session::{FeedSession, FeedSignal, SessionAction};
use super::wire::{parse_frame, FeedPayload, SubscribeRequest};
use crate::config::{FeedConfig, ThrottleConfig};
use crate::eventlog::EventLog;
use crate::metrics::PipelineMetrics;
use crate::models::ParseOutcome;
use crate::pipeline::{admit, normalize, AllowFilter, GeoResolver, ThrottleEngine};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

/// Signal queue depth; a full queue pushes back on the socket reader
const SIGNAL_QUEUE: usize = 4096;

/// What one frame turned into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub normalized: usize,
    pub throttled: usize,
    pub filtered: usize,
    pub appended: usize,
}

pub struct FeedIngestor {
    cfg: FeedConfig,
    session: FeedSession,
    throttle: ThrottleEngine,
    filter: AllowFilter,
    geo: GeoResolver,
    log: Arc<dyn EventLog>,
    metrics: Arc<PipelineMetrics>,
    sweep_every: Duration,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    connection: Option<JoinHandle<()>>,
}

impl FeedIngestor {
    pub fn new(
        cfg: FeedConfig,
        throttle_cfg: &ThrottleConfig,
        geo: GeoResolver,
        log: Arc<dyn EventLog>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            session: FeedSession::new(metrics.clone()),
            throttle: ThrottleEngine::new(throttle_cfg.window(), throttle_cfg.idle(), metrics.clone()),
            filter: AllowFilter::new(
                throttle_cfg.filter_enabled,
                throttle_cfg.filter_asns.iter().copied(),
                metrics.clone(),
            ),
            sweep_every: throttle_cfg.sweep_every(),
            cfg,
            geo,
            log,
            metrics,
            outbound: None,
            connection: None,
        }
    }

    pub fn throttle(&self) -> &ThrottleEngine {
        &self.throttle
    }

    /// Run forever: connect, subscribe, ingest, reconnect after backoff.
    pub async fn run(mut self) {
        let (signals_tx, mut signals_rx) = mpsc::channel::<FeedSignal>(SIGNAL_QUEUE);

        info!(
            url = %self.cfg.url,
            sources = self.cfg.sources.len(),
            filter = self.filter.is_enabled(),
            geo_db = self.geo.has_database(),
            "feed_ingestor_started"
        );

        let mut sweep = interval(self.sweep_every);
        sweep.tick().await;

        let action = self.session.handle(FeedSignal::ConnectRequested);
        self.perform(action, &signals_tx).await;

        loop {
            tokio::select! {
                Some(signal) = signals_rx.recv() => {
                    let action = self.session.handle(signal);
                    self.perform(action, &signals_tx).await;
                }
                _ = sweep.tick() => {
                    self.throttle.sweep_now();
                }
            }
        }
    }

    async fn perform(&mut self, action: SessionAction, signals: &mpsc::Sender<FeedSignal>) {
        match action {
            SessionAction::Idle => {}
            SessionAction::StartConnect { generation } => self.start_connect(generation, signals),
            SessionAction::SendSubscriptions { generation } => self.send_subscriptions(generation),
            SessionAction::Deliver(text) => {
                self.process_frame(&text).await;
            }
            SessionAction::ScheduleBackoff => {
                self.outbound = None;
                let backoff = self.cfg.backoff();
                let signals = signals.clone();
                info!(backoff_ms = backoff.as_millis() as u64, "feed_backoff");
                tokio::spawn(async move {
                    sleep(backoff).await;
                    let _ = signals.send(FeedSignal::BackoffElapsed).await;
                });
            }
        }
    }

    fn start_connect(&mut self, generation: u64, signals: &mpsc::Sender<FeedSignal>) {
        if let Some(previous) = self.connection.take() {
            previous.abort();
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outbound = Some(out_tx);

        let url = self.cfg.url.clone();
        let connect_timeout = self.cfg.connect_timeout();
        let signals = signals.clone();
        self.connection = Some(tokio::spawn(run_connection(
            url,
            connect_timeout,
            generation,
            signals,
            out_rx,
            self.metrics.clone(),
        )));
    }

    /// One request per source, staggered, without waiting for acks.
    fn send_subscriptions(&self, generation: u64) {
        let Some(outbound) = self.outbound.clone() else {
            return;
        };
        let sources = self.cfg.sources.clone();
        let stagger = self.cfg.subscribe_stagger();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            for (i, source) in sources.iter().enumerate() {
                if i > 0 && !stagger.is_zero() {
                    sleep(stagger).await;
                }
                let json = match SubscribeRequest::updates(source.as_str()).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!(source = %source, error = %e, "subscribe_serialize_failed");
                        continue;
                    }
                };
                // Connection gone; the next session replays everything
                if outbound.send(Message::Text(json)).is_err() {
                    debug!(generation, "subscribe_aborted");
                    return;
                }
                metrics.record_subscription_sent();
            }
            info!(generation, sources = sources.len(), "feed_subscriptions_sent");
        });
    }

    /// Admission → normalize → throttle → allow-set → enrich → append.
    ///
    /// Never fails: every per-frame and per-event problem is counted and logged.
    pub async fn process_frame(&mut self, text: &str) -> FrameReport {
        let mut report = FrameReport::default();
        self.metrics.record_frame_received();

        let message = match parse_frame(text) {
            ParseOutcome::Parsed(FeedPayload::Data(message)) => message,
            ParseOutcome::Parsed(FeedPayload::Control(kind)) => {
                self.metrics.record_non_data_frame();
                trace!(kind = %kind, "feed_control_frame");
                return report;
            }
            ParseOutcome::Rejected(reason) => {
                self.metrics.record_frame_parse_error();
                warn!(reason = %reason, "feed_frame_rejected");
                return report;
            }
        };

        let update = match admit(message) {
            ParseOutcome::Parsed(update) => update,
            ParseOutcome::Rejected(reason) => {
                self.metrics.record_admission_reject();
                debug!(reason = %reason, "feed_message_dropped");
                return report;
            }
        };

        let events = normalize(&update);
        report.normalized = events.len();
        self.metrics.record_events_normalized(events.len());

        for mut event in events {
            if self.throttle.should_throttle(&event) {
                report.throttled += 1;
                continue;
            }
            if !self.filter.admits(&event) {
                report.filtered += 1;
                continue;
            }

            self.geo.enrich(&mut event);

            let payload = match event.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    self.metrics.record_append_error();
                    warn!(prefix = %event.prefix, error = %e, "event_serialize_failed");
                    continue;
                }
            };

            match self.log.append(&payload, self.cfg.stream_maxlen).await {
                Ok(id) => {
                    self.metrics.record_event_appended();
                    report.appended += 1;
                    trace!(id = %id, prefix = %event.prefix, kind = %event.kind, "event_appended");
                }
                Err(e) => {
                    self.metrics.record_append_error();
                    warn!(prefix = %event.prefix, error = %e, "event_append_failed");
                }
            }
        }

        report
    }
}

/// Binary frames carry the same JSON as text frames. Invalid UTF-8 counts as
/// a received frame that failed to parse.
fn decode_binary(bytes: Vec<u8>, metrics: &PipelineMetrics) -> Option<String> {
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(e) => {
            metrics.record_frame_received();
            metrics.record_frame_parse_error();
            warn!(len = e.as_bytes().len(), error = %e.utf8_error(), "feed_binary_frame_rejected");
            None
        }
    }
}

/// One connection attempt: connect, then pump frames in and writes out until
/// the socket ends. Outcomes are reported as signals tagged with `generation`.
async fn run_connection(
    url: String,
    connect_timeout: Duration,
    generation: u64,
    signals: mpsc::Sender<FeedSignal>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    metrics: Arc<PipelineMetrics>,
) {
    let failed = |error: String| FeedSignal::Failed { generation, error };

    let request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            let _ = signals.send(failed(format!("invalid feed url: {}", e))).await;
            return;
        }
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024),
        max_frame_size: Some(4 * 1024 * 1024),
        ..Default::default()
    };

    let ws_stream = match timeout(
        connect_timeout,
        connect_async_with_config(request, Some(ws_config), false),
    )
    .await
    {
        Ok(Ok((stream, response))) => {
            debug!(status = %response.status(), generation, "feed_connected");
            stream
        }
        Ok(Err(e)) => {
            let _ = signals.send(failed(e.to_string())).await;
            return;
        }
        Err(_) => {
            let _ = signals.send(failed("connect timeout".to_string())).await;
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    if signals.send(FeedSignal::Opened { generation }).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = read.next() => {
                let signal = match incoming {
                    Some(Ok(Message::Text(text))) => FeedSignal::Frame { generation, text },
                    Some(Ok(Message::Binary(bytes))) => match decode_binary(bytes, &metrics) {
                        Some(text) => FeedSignal::Frame { generation, text },
                        None => continue,
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = signals.send(failed(e.to_string())).await;
                            return;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = signals.send(FeedSignal::Closed { generation, reason }).await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = signals.send(failed(e.to_string())).await;
                        return;
                    }
                    None => {
                        let _ = signals.send(FeedSignal::Closed { generation, reason: None }).await;
                        return;
                    }
                };

                if signals.send(signal).await.is_err() {
                    return;
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = write.send(message).await {
                            let _ = signals.send(failed(e.to_string())).await;
                            return;
                        }
                    }
                    None => {
                        // Session moved on without us
                        let _ = write.close().await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::MemoryEventLog;
    use crate::models::{Event, EventKind};

    fn ingestor(throttle_cfg: ThrottleConfig) -> (FeedIngestor, Arc<MemoryEventLog>, Arc<PipelineMetrics>) {
        let metrics = PipelineMetrics::shared();
        let log = Arc::new(MemoryEventLog::new());
        let geo = GeoResolver::new(metrics.clone());
        let ingestor = FeedIngestor::new(
            FeedConfig::default(),
            &throttle_cfg,
            geo,
            log.clone(),
            metrics.clone(),
        );
        (ingestor, log, metrics)
    }

    fn update_frame(ts: f64, path: &str, announced: &[&str], withdrawn: &[&str]) -> String {
        let announcements = if announced.is_empty() {
            "[]".to_string()
        } else {
            format!(
                r#"[{{"next_hop":"192.0.2.1","prefixes":{}}}]"#,
                serde_json::to_string(announced).unwrap()
            )
        };
        format!(
            r#"{{"type":"data","payload":{{"timestamp":{},"peer":"192.0.2.1","peer_asn":"3333","host":"rrc00","path":{},"announcements":{},"withdrawals":{}}}}}"#,
            ts,
            path,
            announcements,
            serde_json::to_string(withdrawn).unwrap()
        )
    }

    #[tokio::test]
    async fn test_frame_to_log() {
        let (mut ingestor, log, metrics) = ingestor(ThrottleConfig::default());
        let frame = update_frame(100.0, "[3333,64500,13335]", &["203.0.113.0/24"], &["198.51.100.0/24"]);

        let report = ingestor.process_frame(&frame).await;
        assert_eq!(report.normalized, 2);
        assert_eq!(report.appended, 2);
        assert_eq!(log.len(), 2);

        let stored: Vec<Event> = log
            .payloads()
            .iter()
            .map(|p| Event::from_json(p).unwrap())
            .collect();
        assert_eq!(stored[0].kind, EventKind::Announce);
        assert_eq!(stored[0].origin_id, Some(13335));
        assert!(stored[0].is_enriched());
        assert_eq!(stored[1].kind, EventKind::Withdraw);
        assert!(stored[1].is_enriched());
        assert_eq!(metrics.snapshot().events_appended, 2);
    }

    #[tokio::test]
    async fn test_duplicates_not_appended() {
        let (mut ingestor, log, metrics) = ingestor(ThrottleConfig::default());
        let first = update_frame(100.0, "[3333,64500,64501]", &["10.0.0.0/24"], &[]);
        let repeat = update_frame(100.2, "[3333,64500,64501]", &["10.0.0.0/24"], &[]);

        ingestor.process_frame(&first).await;
        let report = ingestor.process_frame(&repeat).await;

        assert_eq!(report.throttled, 1);
        assert_eq!(log.len(), 1);
        assert_eq!(metrics.snapshot().throttled, 1);
    }

    #[tokio::test]
    async fn test_filter_runs_after_throttle() {
        let cfg = ThrottleConfig {
            filter_enabled: true,
            filter_asns: vec![64999],
            ..ThrottleConfig::default()
        };
        let (mut ingestor, log, _) = ingestor(cfg);
        let frame = update_frame(100.0, "[3333,64500]", &["10.0.0.0/24"], &[]);

        let report = ingestor.process_frame(&frame).await;
        assert_eq!(report.filtered, 1);
        assert!(log.is_empty());
        // Throttle still saw the event
        assert!(ingestor.throttle().state("10.0.0.0/24").is_some());
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_stop_processing() {
        let (mut ingestor, log, metrics) = ingestor(ThrottleConfig::default());

        ingestor.process_frame("garbage").await;
        ingestor.process_frame(r#"{"type":"ris_subscribe_ok"}"#).await;
        ingestor
            .process_frame(r#"{"type":"data","payload":{"timestamp":1.0,"host":"rrc00","withdrawals":["10.0.0.0/8"]}}"#)
            .await;
        let report = ingestor
            .process_frame(&update_frame(5.0, "[]", &[], &["10.0.0.0/8"]))
            .await;

        assert_eq!(report.appended, 1);
        assert_eq!(log.len(), 1);
        let s = metrics.snapshot();
        assert_eq!(s.frames_received, 4);
        assert_eq!(s.frame_parse_errors, 1);
        assert_eq!(s.non_data_frames, 1);
        assert_eq!(s.admission_rejects, 1);
    }

    #[test]
    fn test_binary_frames_decoded_or_counted() {
        let metrics = PipelineMetrics::new();

        let text = decode_binary(br#"{"type":"ris_pong"}"#.to_vec(), &metrics);
        assert_eq!(text.as_deref(), Some(r#"{"type":"ris_pong"}"#));
        assert_eq!(metrics.snapshot().frame_parse_errors, 0);

        assert!(decode_binary(vec![0x7b, 0xff, 0xfe, 0x7d], &metrics).is_none());
        let s = metrics.snapshot();
        assert_eq!(s.frame_parse_errors, 1);
        assert_eq!(s.frames_received, 1);
    }
}
