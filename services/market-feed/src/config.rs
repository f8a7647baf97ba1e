//! Runtime configuration for the feed service.
//!
//! Every timing and sizing constant of the distribution layer lives here so
//! tests can shrink intervals and the binary can override them from the
//! command line.

use std::time::Duration;

/// Configuration for the feed service.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Trade batch / order-book throttle window (default: 16ms, ~60Hz).
    pub throttle_interval: Duration,
    /// Max trades per `trades` message (default: 10).
    pub max_trades_per_batch: usize,
    /// Levels per side in throttled `orderbook` broadcasts (default: 10).
    pub orderbook_depth: usize,
    /// Levels per side in the snapshot sent on subscribe. `None` defers to
    /// the engine's own default depth.
    pub snapshot_depth: Option<usize>,
    /// Engine statistics push period (default: 1s).
    pub metrics_interval: Duration,
    /// Liveness probe period (default: 30s).
    pub heartbeat_interval: Duration,
    /// Outbound frame queue capacity per connection.
    pub client_buffer: usize,
    /// Text of the `connection` acknowledgement.
    pub welcome_message: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(16),
            max_trades_per_batch: 10,
            orderbook_depth: 10,
            snapshot_depth: None,
            metrics_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(30_000),
            client_buffer: 1024,
            welcome_message: "Connected to market feed".to_string(),
        }
    }
}

impl FeedConfig {
    /// Clamp values that would make the timers or queues degenerate.
    pub fn sanitized(mut self) -> Self {
        let floor = Duration::from_millis(1);
        self.throttle_interval = self.throttle_interval.max(floor);
        self.metrics_interval = self.metrics_interval.max(floor);
        self.heartbeat_interval = self.heartbeat_interval.max(floor);
        self.max_trades_per_batch = self.max_trades_per_batch.max(1);
        self.orderbook_depth = self.orderbook_depth.max(1);
        self.client_buffer = self.client_buffer.max(1);
        self
    }
}
