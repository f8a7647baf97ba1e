//! Periodic engine statistics broadcast on the `metrics` channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::codec::{OutboundMessage, ServerMessage};
use crate::engine::MarketEngine;
use crate::metrics::FeedMetrics;
use crate::registry::ConnectionRegistry;
use crate::subscription::Channel;

pub struct StatsBroadcaster {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<dyn MarketEngine>,
    metrics: Arc<FeedMetrics>,
    interval: Duration,
}

impl StatsBroadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<dyn MarketEngine>,
        metrics: Arc<FeedMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            metrics,
            interval,
        }
    }

    /// One broadcast round.
    ///
    /// The engine is not queried at all when nobody holds a `metrics`
    /// subscription. Otherwise it is queried once and the same payload goes
    /// to every metrics subscriber. Returns the number of recipients.
    pub fn tick(&self) -> usize {
        let recipients = self.registry.subscribers_of_channel(Channel::Metrics);
        if recipients.is_empty() {
            return 0;
        }

        self.metrics.record_stats_query();
        let stats = match self.engine.stats() {
            Ok(stats) => stats,
            Err(e) => {
                self.metrics.record_engine_failure();
                warn!(error = %e, "Stats query failed, skipping metrics broadcast");
                return 0;
            }
        };

        let message = OutboundMessage::new(ServerMessage::Metrics { data: stats });
        let delivered = self.registry.deliver(&recipients, &message);
        self.metrics.record_metrics_broadcast();
        debug!(delivered, "Broadcast engine stats");
        delivered
    }

    /// Tick every interval until the task is aborted. The first tick is one
    /// full interval after start.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick();
        }
    }
}
