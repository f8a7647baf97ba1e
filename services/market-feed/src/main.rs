//! Market feed entry point.
//!
//! Runs the WebSocket distribution layer on top of the in-process reference
//! book engine. With `--replay` a command journal is streamed into the engine
//! so connected clients see live-looking market data.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use market_feed::config::FeedConfig;
use market_feed::logging::init_logging;
use market_feed::order_book::BookEngine;
use market_feed::replay::replay_file;
use market_feed::server::{create_router, AppState};
use market_feed::service::FeedService;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "market-feed")]
#[command(about = "Real-time market data distribution over WebSocket")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "MARKET_FEED_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "MARKET_FEED_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "MARKET_FEED_LOG_JSON")]
    log_json: bool,

    /// Trade batch and order book throttle window, milliseconds
    #[arg(long, env = "MARKET_FEED_THROTTLE_MS", default_value_t = 16)]
    throttle_ms: u64,

    /// Max trades per batch message
    #[arg(long, env = "MARKET_FEED_MAX_BATCH", default_value_t = 10)]
    max_batch: usize,

    /// Levels per side in throttled order book broadcasts
    #[arg(long, env = "MARKET_FEED_ORDERBOOK_DEPTH", default_value_t = 10)]
    orderbook_depth: usize,

    /// Levels per side in the snapshot sent on subscribe (engine default if unset)
    #[arg(long, env = "MARKET_FEED_SNAPSHOT_DEPTH")]
    snapshot_depth: Option<usize>,

    /// Engine stats push period, milliseconds
    #[arg(long, env = "MARKET_FEED_METRICS_MS", default_value_t = 1000)]
    metrics_ms: u64,

    /// Liveness probe period, milliseconds
    #[arg(long, env = "MARKET_FEED_HEARTBEAT_MS", default_value_t = 30_000)]
    heartbeat_ms: u64,

    /// Outbound queue capacity per client
    #[arg(long, env = "MARKET_FEED_CLIENT_BUFFER", default_value_t = 1024)]
    client_buffer: usize,

    /// JSON Lines command journal to stream into the engine
    #[arg(long, env = "MARKET_FEED_REPLAY")]
    replay: Option<PathBuf>,

    /// Delay between replayed commands, milliseconds
    #[arg(long, env = "MARKET_FEED_REPLAY_PACE_MS", default_value_t = 0)]
    replay_pace_ms: u64,
}

impl Args {
    fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            throttle_interval: Duration::from_millis(self.throttle_ms),
            max_trades_per_batch: self.max_batch,
            orderbook_depth: self.orderbook_depth,
            snapshot_depth: self.snapshot_depth,
            metrics_interval: Duration::from_millis(self.metrics_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            client_buffer: self.client_buffer,
            ..FeedConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    info!(version = market_feed::SERVICE_VERSION, "Starting market feed");

    let (engine, events) = BookEngine::new();
    let engine = Arc::new(engine);

    let service = FeedService::new(engine.clone(), args.feed_config());
    service.start(events);

    if let Some(path) = args.replay.clone() {
        let engine = engine.clone();
        let pace = Duration::from_millis(args.replay_pace_ms);
        tokio::spawn(async move {
            if let Err(e) = replay_file(&engine, &path, pace).await {
                error!(path = %path.display(), error = %e, "Journal replay failed");
            }
        });
    }

    let app = create_router(AppState::new(service.clone()));
    let listener = TcpListener::bind(args.bind).await?;
    info!(addr = %args.bind, "Market feed listening on /ws/market");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown();
    info!("Market feed stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
