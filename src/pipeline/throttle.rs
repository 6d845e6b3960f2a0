//! Per-prefix duplicate suppression
//!
//! Tracks the last admitted kind and path fingerprint for every prefix and
//! drops repeats inside the throttle window. Anything that carries new
//! information (first sighting, window elapsed, kind flip, path change, long
//! path, major-transit hop) is admitted and becomes the new baseline.

use crate::metrics::PipelineMetrics;
use crate::models::{Event, EventKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Paths longer than this are never throttled
pub const MAX_UNTHROTTLED_HOPS: usize = 7;

lazy_static::lazy_static! {
    /// Backbone operators; any path crossing one of them is always admitted
    pub static ref MAJOR_TRANSIT: HashSet<u32> = [
        174,   // Cogent
        209,   // Lumen (CenturyLink)
        701,   // Verizon
        1239,  // Sprint
        1299,  // Arelion
        2828,  // Verizon (XO)
        2914,  // NTT
        3257,  // GTT
        3320,  // Deutsche Telekom
        3356,  // Lumen (Level3)
        3491,  // PCCW
        5511,  // Orange
        6453,  // Tata
        6461,  // Zayo
        6762,  // Telecom Italia Sparkle
        6830,  // Liberty Global
        7018,  // AT&T
        12956, // Telefonica
    ]
    .into_iter()
    .collect();
}

/// Stored baseline for one prefix
#[derive(Debug, Clone, PartialEq)]
pub struct PrefixState {
    pub last_seen_ts: f64,
    pub last_fingerprint: String,
    pub last_kind: EventKind,
}

impl PrefixState {
    fn from_event(event: &Event) -> Self {
        Self {
            last_seen_ts: event.ts,
            last_fingerprint: event.path_fingerprint(),
            last_kind: event.kind,
        }
    }
}

/// Why an event was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReason {
    FirstSighting,
    WindowElapsed,
    TypeFlip,
    PathChange,
    LongPath,
    MajorTransit,
}

impl std::fmt::Display for AdmitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitReason::FirstSighting => write!(f, "first_sighting"),
            AdmitReason::WindowElapsed => write!(f, "window_elapsed"),
            AdmitReason::TypeFlip => write!(f, "type_flip"),
            AdmitReason::PathChange => write!(f, "path_change"),
            AdmitReason::LongPath => write!(f, "long_path"),
            AdmitReason::MajorTransit => write!(f, "major_transit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Admit(AdmitReason),
    Throttle,
}

impl ThrottleDecision {
    pub fn is_throttled(&self) -> bool {
        matches!(self, ThrottleDecision::Throttle)
    }
}

pub struct ThrottleEngine {
    window_secs: f64,
    idle_secs: f64,
    states: HashMap<String, PrefixState>,
    metrics: Arc<PipelineMetrics>,
}

impl ThrottleEngine {
    pub fn new(window: Duration, idle: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            window_secs: window.as_secs_f64(),
            idle_secs: idle.as_secs_f64(),
            states: HashMap::new(),
            metrics,
        }
    }

    /// True when the event is a duplicate and must be dropped.
    pub fn should_throttle(&mut self, event: &Event) -> bool {
        self.evaluate(event).is_throttled()
    }

    /// Apply the admission rules in order; the first match decides.
    pub fn evaluate(&mut self, event: &Event) -> ThrottleDecision {
        let decision = match self.states.get(&event.prefix) {
            None => ThrottleDecision::Admit(AdmitReason::FirstSighting),
            Some(state) => {
                // Out-of-order timestamps give a negative elapsed: inside the window
                let elapsed = event.ts - state.last_seen_ts;
                if elapsed > self.window_secs {
                    ThrottleDecision::Admit(AdmitReason::WindowElapsed)
                } else if event.kind != state.last_kind {
                    ThrottleDecision::Admit(AdmitReason::TypeFlip)
                } else if event.path_fingerprint() != state.last_fingerprint {
                    ThrottleDecision::Admit(AdmitReason::PathChange)
                } else if event.path.len() > MAX_UNTHROTTLED_HOPS {
                    ThrottleDecision::Admit(AdmitReason::LongPath)
                } else if event.path.iter().any(|asn| MAJOR_TRANSIT.contains(asn)) {
                    ThrottleDecision::Admit(AdmitReason::MajorTransit)
                } else {
                    ThrottleDecision::Throttle
                }
            }
        };

        match decision {
            ThrottleDecision::Admit(reason) => {
                self.record_admit(reason);
                self.states
                    .insert(event.prefix.clone(), PrefixState::from_event(event));
                self.metrics.set_tracked_prefixes(self.states.len());
                trace!(prefix = %event.prefix, kind = %event.kind, reason = %reason, "throttle_admit");
            }
            ThrottleDecision::Throttle => {
                self.metrics.record_throttled();
                trace!(prefix = %event.prefix, "throttle_drop");
            }
        }

        decision
    }

    fn record_admit(&self, reason: AdmitReason) {
        self.metrics.record_admitted();
        match reason {
            AdmitReason::FirstSighting => self.metrics.record_first_sighting(),
            AdmitReason::WindowElapsed => self.metrics.record_window_reset(),
            AdmitReason::TypeFlip => self.metrics.record_type_flip(),
            AdmitReason::PathChange => self.metrics.record_path_change(),
            AdmitReason::LongPath => self.metrics.record_long_path_admit(),
            AdmitReason::MajorTransit => self.metrics.record_transit_admit(),
        }
    }

    /// Evict every prefix whose last admitted event is older than the idle age.
    pub fn sweep(&mut self, now_ts: f64) -> usize {
        let idle = self.idle_secs;
        let before = self.states.len();
        self.states
            .retain(|_, state| now_ts - state.last_seen_ts <= idle);
        let evicted = before - self.states.len();

        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            debug!(evicted, remaining = self.states.len(), "throttle_sweep");
        }
        self.metrics.set_tracked_prefixes(self.states.len());
        evicted
    }

    /// Sweep against wall-clock now
    pub fn sweep_now(&mut self) -> usize {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.sweep(now)
    }

    pub fn state(&self, prefix: &str) -> Option<&PrefixState> {
        self.states.get(prefix)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

/// Optional post-throttle stage restricting output to an allow-set of ASNs
pub struct AllowFilter {
    enabled: bool,
    members: HashSet<u32>,
    metrics: Arc<PipelineMetrics>,
}

impl AllowFilter {
    pub fn new(enabled: bool, members: impl IntoIterator<Item = u32>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            enabled,
            members: members.into_iter().collect(),
            metrics,
        }
    }

    pub fn disabled(metrics: Arc<PipelineMetrics>) -> Self {
        Self::new(false, std::iter::empty(), metrics)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Peer, origin or any path hop in the allow-set
    pub fn admits(&self, event: &Event) -> bool {
        if !self.enabled {
            return true;
        }

        let hit = self.members.contains(&event.peer_id)
            || event.origin_id.map_or(false, |o| self.members.contains(&o))
            || event.path.iter().any(|asn| self.members.contains(asn));

        if !hit {
            self.metrics.record_filtered_out();
        }
        hit
    }
}
