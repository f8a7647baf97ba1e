//! Logging initialization using the `tracing` ecosystem.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `log_level` is used when `RUST_LOG` is not set (e.g. `"info"` or
/// `"market_feed=debug,tower_http=info"`). Calling this twice is harmless:
/// the second installation attempt is ignored.
pub fn init_logging(log_level: &str, json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer().with_target(true).with_thread_ids(true);

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer.with_ansi(true))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
