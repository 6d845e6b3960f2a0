use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RunMode;
use crate::eventlog::EventLog;
use crate::fanout::SubscriberSet;
use crate::metrics::PipelineMetrics;
use crate::models::ServerFrame;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn EventLog>,
    pub subscribers: SubscriberSet,
    pub metrics: Arc<PipelineMetrics>,
    pub ping_interval: Duration,
    pub subscriber_queue: usize,
}

/// Create the API router. `/ws/live` is only served where the fan-out runs.
pub fn create_router(state: AppState, allowed_origins: &[String], mode: RunMode) -> Router {
    let mut router: Router<AppState> = Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(prometheus_metrics));
    if mode.runs_fanout() {
        router = router.route("/ws/live", get(live_socket));
    }

    router
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);

    if allowed_origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "invalid_cors_origin");
                None
            }
        })
        .collect();

    base.allow_origin(AllowOrigin::list(origins))
}

// ===== Route Handlers =====

/// Durable log reachable → `{"ok": true}`
async fn health_check(State(state): State<AppState>) -> Response {
    match state.log.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => {
            warn!(error = %e, "health_check_failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ok": false }))).into_response()
        }
    }
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
        .into_response()
}

async fn live_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ===== Subscriber Connection =====

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (id, mut frames) = state.subscribers.register(state.subscriber_queue);
    state.metrics.set_subscribers_connected(state.subscribers.len());
    info!(subscriber = id, connected = state.subscribers.len(), "subscriber_connected");

    let ping = serde_json::to_string(&ServerFrame::Ping)
        .unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string());
    let mut keepalive = interval_at(Instant::now() + state.ping_interval, state.ping_interval);

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    // Pruned by the fan-out after a failed enqueue
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                if socket.send(Message::Text(ping.clone())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // No client protocol beyond connect/close
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.subscribers.unregister(id);
    state.metrics.set_subscribers_connected(state.subscribers.len());
    debug!(subscriber = id, connected = state.subscribers.len(), "subscriber_disconnected");
}
