//! Feed Session State Machine
//!
//! `Disconnected → Connecting → Subscribed → Disconnected → (backoff) → Connecting`
//!
//! The session never touches a socket. Connection tasks and timers report
//! what happened as `FeedSignal`s over a channel; `handle` applies the
//! transition and tells the driver what to do next. Every connection attempt
//! gets a generation number so signals from an abandoned socket are ignored.

use crate::metrics::PipelineMetrics;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Subscribed => write!(f, "SUBSCRIBED"),
        }
    }
}

/// Reason for state transition (for logging)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    ConnectRequested,
    BackoffElapsed,
    Opened,
    ServerClose,
    TransportError,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectRequested => write!(f, "connect_requested"),
            Self::BackoffElapsed => write!(f, "backoff_elapsed"),
            Self::Opened => write!(f, "opened"),
            Self::ServerClose => write!(f, "server_close"),
            Self::TransportError => write!(f, "transport_error"),
        }
    }
}

/// Discrete things that happen to the feed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    ConnectRequested,
    Opened { generation: u64 },
    Frame { generation: u64, text: String },
    Closed { generation: u64, reason: Option<String> },
    Failed { generation: u64, error: String },
    BackoffElapsed,
}

/// What the driver must do after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Idle,
    StartConnect { generation: u64 },
    SendSubscriptions { generation: u64 },
    Deliver(String),
    ScheduleBackoff,
}

pub struct FeedSession {
    state: FeedState,
    generation: u64,
    metrics: Arc<PipelineMetrics>,
}

impl FeedSession {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            state: FeedState::Disconnected,
            generation: 0,
            metrics,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&mut self, signal: FeedSignal) -> SessionAction {
        match signal {
            FeedSignal::ConnectRequested => self.begin_connect(TransitionReason::ConnectRequested),
            FeedSignal::BackoffElapsed => self.begin_connect(TransitionReason::BackoffElapsed),

            FeedSignal::Opened { generation } => {
                if !self.is_current(generation) || self.state != FeedState::Connecting {
                    return SessionAction::Idle;
                }
                self.transition(FeedState::Subscribed, TransitionReason::Opened);
                SessionAction::SendSubscriptions { generation }
            }

            FeedSignal::Frame { generation, text } => {
                if self.is_current(generation) && self.state == FeedState::Subscribed {
                    SessionAction::Deliver(text)
                } else {
                    SessionAction::Idle
                }
            }

            FeedSignal::Closed { generation, reason } => {
                if !self.is_current(generation) || self.state == FeedState::Disconnected {
                    return SessionAction::Idle;
                }
                info!(reason = reason.as_deref().unwrap_or(""), "feed_closed");
                self.transition(FeedState::Disconnected, TransitionReason::ServerClose);
                SessionAction::ScheduleBackoff
            }

            FeedSignal::Failed { generation, error } => {
                if !self.is_current(generation) || self.state == FeedState::Disconnected {
                    return SessionAction::Idle;
                }
                warn!(error = %error, state = %self.state, "feed_error");
                self.transition(FeedState::Disconnected, TransitionReason::TransportError);
                SessionAction::ScheduleBackoff
            }
        }
    }

    fn begin_connect(&mut self, reason: TransitionReason) -> SessionAction {
        // Connecting or already connected: nothing to do
        if self.state != FeedState::Disconnected {
            debug!(state = %self.state, reason = %reason, "feed_connect_ignored");
            return SessionAction::Idle;
        }
        self.generation += 1;
        self.transition(FeedState::Connecting, reason);
        SessionAction::StartConnect {
            generation: self.generation,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    fn transition(&mut self, new_state: FeedState, reason: TransitionReason) {
        let old_state = self.state;
        self.state = new_state;

        match new_state {
            FeedState::Connecting => self.metrics.record_connect_attempt(),
            FeedState::Subscribed => self.metrics.record_connect_success(),
            FeedState::Disconnected => self.metrics.record_disconnect(),
        }

        info!(
            from = %old_state,
            to = %new_state,
            reason = %reason,
            generation = self.generation,
            "feed_transition"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (FeedSession, Arc<PipelineMetrics>) {
        let metrics = PipelineMetrics::shared();
        (FeedSession::new(metrics.clone()), metrics)
    }

    #[test]
    fn test_full_cycle() {
        let (mut s, metrics) = session();
        assert_eq!(s.state(), FeedState::Disconnected);

        assert_eq!(
            s.handle(FeedSignal::ConnectRequested),
            SessionAction::StartConnect { generation: 1 }
        );
        assert_eq!(s.state(), FeedState::Connecting);

        assert_eq!(
            s.handle(FeedSignal::Opened { generation: 1 }),
            SessionAction::SendSubscriptions { generation: 1 }
        );
        assert_eq!(s.state(), FeedState::Subscribed);

        assert_eq!(
            s.handle(FeedSignal::Frame { generation: 1, text: "x".into() }),
            SessionAction::Deliver("x".into())
        );

        assert_eq!(
            s.handle(FeedSignal::Closed { generation: 1, reason: None }),
            SessionAction::ScheduleBackoff
        );
        assert_eq!(s.state(), FeedState::Disconnected);

        assert_eq!(
            s.handle(FeedSignal::BackoffElapsed),
            SessionAction::StartConnect { generation: 2 }
        );

        let m = metrics.snapshot();
        assert_eq!(m.connect_attempts, 2);
        assert_eq!(m.connect_successes, 1);
        assert_eq!(m.disconnects, 1);
    }

    #[test]
    fn test_connect_while_connecting_is_noop() {
        let (mut s, metrics) = session();
        s.handle(FeedSignal::ConnectRequested);
        assert_eq!(s.handle(FeedSignal::ConnectRequested), SessionAction::Idle);
        assert_eq!(s.handle(FeedSignal::BackoffElapsed), SessionAction::Idle);
        assert_eq!(s.generation(), 1);
        assert_eq!(metrics.snapshot().connect_attempts, 1);
    }

    #[test]
    fn test_failed_connect_backs_off() {
        let (mut s, _) = session();
        s.handle(FeedSignal::ConnectRequested);
        assert_eq!(
            s.handle(FeedSignal::Failed { generation: 1, error: "refused".into() }),
            SessionAction::ScheduleBackoff
        );
        assert_eq!(s.state(), FeedState::Disconnected);
    }

    #[test]
    fn test_stale_generation_ignored() {
        let (mut s, _) = session();
        s.handle(FeedSignal::ConnectRequested);
        s.handle(FeedSignal::Failed { generation: 1, error: "reset".into() });
        s.handle(FeedSignal::BackoffElapsed);

        // Late signals from the first socket
        assert_eq!(s.handle(FeedSignal::Opened { generation: 1 }), SessionAction::Idle);
        assert_eq!(
            s.handle(FeedSignal::Closed { generation: 1, reason: None }),
            SessionAction::Idle
        );
        assert_eq!(s.state(), FeedState::Connecting);
    }

    #[test]
    fn test_frames_dropped_before_subscribed() {
        let (mut s, _) = session();
        s.handle(FeedSignal::ConnectRequested);
        assert_eq!(
            s.handle(FeedSignal::Frame { generation: 1, text: "early".into() }),
            SessionAction::Idle
        );
    }

    #[test]
    fn test_duplicate_close_single_backoff() {
        let (mut s, _) = session();
        s.handle(FeedSignal::ConnectRequested);
        s.handle(FeedSignal::Opened { generation: 1 });
        assert_eq!(
            s.handle(FeedSignal::Failed { generation: 1, error: "eof".into() }),
            SessionAction::ScheduleBackoff
        );
        assert_eq!(
            s.handle(FeedSignal::Closed { generation: 1, reason: None }),
            SessionAction::Idle
        );
    }
}
