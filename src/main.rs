//! RouteWatch
//!
//! Feed ingestion (normalize → throttle → enrich → append) and stream fan-out
//! to live viewers, in one process or split by `--mode`.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use routewatch_backend::api::{create_router, AppState};
use routewatch_backend::config::{AppConfig, RunMode};
use routewatch_backend::eventlog::{EventLog, RedisStreamLog};
use routewatch_backend::fanout::{StreamFanout, SubscriberSet};
use routewatch_backend::ingest::FeedIngestor;
use routewatch_backend::metrics::{run_reporter, PipelineMetrics};
use routewatch_backend::pipeline::GeoResolver;

#[derive(Parser, Debug)]
#[command(name = "routewatch")]
#[command(about = "BGP update ingestion and live fan-out")]
struct Cli {
    /// Which pipeline halves to run
    #[arg(long, env = "ROUTEWATCH_MODE", value_enum, default_value = "all")]
    mode: RunMode,

    /// Listen port (overrides LISTEN_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    config.validate(cli.mode)?;

    info!(
        mode = %cli.mode,
        stream = %config.stream_key,
        group = %config.fanout.group,
        consumer = %config.fanout.consumer,
        "routewatch_starting"
    );

    let metrics = PipelineMetrics::shared();

    let log: Arc<dyn EventLog> = Arc::new(
        RedisStreamLog::connect(&config.redis_url, config.stream_key.clone())
            .await
            .context("initial durable log connection failed")?,
    );

    let subscribers = SubscriberSet::new();

    if cli.mode.runs_ingest() {
        let geo = GeoResolver::from_config(&config.geo, metrics.clone())?;
        let ingestor = FeedIngestor::new(
            config.feed.clone(),
            &config.throttle,
            geo,
            log.clone(),
            metrics.clone(),
        );
        tokio::spawn(ingestor.run());
    }

    if cli.mode.runs_fanout() {
        log.ensure_group(&config.fanout.group)
            .await
            .context("consumer group setup failed")?;
        let fanout = StreamFanout::new(
            log.clone(),
            subscribers.clone(),
            config.fanout.clone(),
            metrics.clone(),
        );
        tokio::spawn(fanout.run());
    }

    tokio::spawn(run_reporter(
        metrics.clone(),
        Duration::from_secs(config.metrics_report_secs),
    ));

    let state = AppState {
        log,
        subscribers,
        metrics,
        ping_interval: config.fanout.ping_interval(),
        subscriber_queue: config.fanout.subscriber_queue,
    };
    let app = create_router(state, &config.allowed_origins, cli.mode);

    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "http_listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "http_server_failed");
        return Err(e).context("Server error");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routewatch_backend=info,routewatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate root, for runs started from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
