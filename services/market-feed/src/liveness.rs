//! Heartbeat sweep.
//!
//! Every interval each connection is either evicted, when the probe sent on
//! the previous sweep went unanswered, or marked pending and probed again.
//! Any pong (or client ping) between two sweeps marks it alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::FeedError;
use crate::registry::ConnectionRegistry;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: usize,
}

pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        self.registry.for_each(|conn| {
            if !conn.mark_pending() {
                if self.registry.evict(&conn.id()) {
                    report.evicted += 1;
                }
                return;
            }

            match conn.probe() {
                Ok(()) => report.probed += 1,
                // Stays pending; a connection that cannot drain its queue is
                // evicted on the next sweep unless it answers.
                Err(FeedError::ChannelFull) => {
                    debug!(connection_id = %conn.id(), "Outbound queue full, probe skipped");
                }
                Err(e) => {
                    debug!(connection_id = %conn.id(), error = %e, "Probe failed, removing connection");
                    self.registry.remove(&conn.id());
                }
            }
        });

        if report.evicted > 0 {
            info!(evicted = report.evicted, probed = report.probed, "Heartbeat sweep evicted stale connections");
        }
        report
    }

    /// Sweep every interval until the task is aborted. The first sweep is
    /// one full interval after start.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::metrics::FeedMetrics;
    use tokio::sync::mpsc;

    fn setup() -> (LivenessMonitor, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(FeedMetrics::new())));
        (
            LivenessMonitor::new(registry.clone(), Duration::from_secs(30)),
            registry,
        )
    }

    #[test]
    fn test_responsive_connection_survives() {
        let (monitor, registry) = setup();
        let (tx, mut rx) = mpsc::channel(16);
        let conn = registry.register(tx);

        for _ in 0..3 {
            assert_eq!(monitor.sweep(), SweepReport { probed: 1, evicted: 0 });
            assert!(matches!(rx.try_recv(), Ok(Outbound::Ping)));
            conn.mark_alive();
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_silent_connection_evicted_on_second_sweep() {
        let (monitor, registry) = setup();
        let (tx, mut rx) = mpsc::channel(16);
        let conn = registry.register(tx);

        assert_eq!(monitor.sweep().probed, 1);
        assert!(registry.get(&conn.id()).is_some());

        assert_eq!(monitor.sweep().evicted, 1);
        assert!(registry.get(&conn.id()).is_none());
        assert!(conn.is_closed());

        assert!(matches!(rx.try_recv(), Ok(Outbound::Ping)));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_closed_transport_removed_on_probe() {
        let (monitor, registry) = setup();
        let (tx, rx) = mpsc::channel(16);
        let conn = registry.register(tx);
        drop(rx);

        assert_eq!(monitor.sweep(), SweepReport::default());
        assert!(registry.get(&conn.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_evicts_after_two_intervals() {
        let (monitor, registry) = setup();
        let (tx, mut rx) = mpsc::channel(16);
        let conn = registry.register(tx);
        let start = Instant::now();

        let task = tokio::spawn(Arc::new(monitor).run());

        assert!(matches!(rx.recv().await, Some(Outbound::Ping)));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(conn.is_closed());
        assert!(registry.is_empty());

        task.abort();
    }
}
