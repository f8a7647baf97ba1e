//! Per-pair order-book broadcast throttling.
//!
//! Order updates only mark a pair dirty. The first update arms a timer; any
//! further updates before it fires are coalesced. When the timer fires the
//! pair goes back to idle and one fresh depth snapshot is pulled from the
//! engine and broadcast, so at most one `orderbook` message per pair leaves
//! per throttle interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use types::ids::Pair;

use crate::codec::{OutboundMessage, ServerMessage};
use crate::engine::MarketEngine;
use crate::metrics::FeedMetrics;
use crate::registry::ConnectionRegistry;
use crate::subscription::Channel;

pub struct OrderBookThrottler {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<dyn MarketEngine>,
    metrics: Arc<FeedMetrics>,
    interval: Duration,
    depth: usize,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    scheduled: HashMap<Pair, JoinHandle<()>>,
    /// Set by `cancel_all`; no timer is armed afterwards.
    closed: bool,
}

impl OrderBookThrottler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<dyn MarketEngine>,
        metrics: Arc<FeedMetrics>,
        interval: Duration,
        depth: usize,
    ) -> Self {
        Self {
            registry,
            engine,
            metrics,
            interval,
            depth,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `pair`'s book changed.
    ///
    /// Returns true when this call armed a new broadcast, false when it was
    /// coalesced into one already pending or the throttler is cancelled.
    pub fn notify(self: &Arc<Self>, pair: Pair) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        if state.scheduled.contains_key(&pair) {
            self.metrics.record_orderbook_event(true);
            return false;
        }

        let throttler = Arc::clone(self);
        let timer_pair = pair.clone();
        let deadline = Instant::now() + self.interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            throttler.fire(&timer_pair);
        });
        state.scheduled.insert(pair, handle);
        self.metrics.record_orderbook_event(false);
        true
    }

    /// Cancel every pending broadcast and ignore later notifications.
    /// Returns the number cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.state();
        state.closed = true;
        let count = state.scheduled.len();
        for (_, handle) in state.scheduled.drain() {
            handle.abort();
        }
        count
    }

    pub fn is_scheduled(&self, pair: &Pair) -> bool {
        self.state().scheduled.contains_key(pair)
    }

    fn fire(&self, pair: &Pair) {
        // Back to idle before querying, so updates racing the query arm the
        // next broadcast instead of being lost.
        self.state().scheduled.remove(pair);

        let mut snapshot = match self.engine.depth(pair, Some(self.depth)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.record_engine_failure();
                warn!(pair = %pair, error = %e, "Depth query failed, skipping order book broadcast");
                return;
            }
        };
        snapshot.truncate(self.depth);

        let message = OutboundMessage::new(ServerMessage::Orderbook {
            pair: pair.clone(),
            data: snapshot,
        });
        let delivered = self.registry.broadcast(Channel::Orderbook, pair, &message);
        self.metrics.record_orderbook_broadcast();
        debug!(pair = %pair, delivered, "Broadcast order book");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::engine::stub::StubEngine;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    struct Fixture {
        throttler: Arc<OrderBookThrottler>,
        registry: Arc<ConnectionRegistry>,
        engine: Arc<StubEngine>,
        metrics: Arc<FeedMetrics>,
    }

    fn fixture(engine: StubEngine) -> Fixture {
        let metrics = Arc::new(FeedMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let engine = Arc::new(engine);
        let throttler = Arc::new(OrderBookThrottler::new(
            registry.clone(),
            engine.clone(),
            metrics.clone(),
            Duration::from_millis(16),
            10,
        ));
        Fixture {
            throttler,
            registry,
            engine,
            metrics,
        }
    }

    fn subscriber(registry: &ConnectionRegistry, pair: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(64);
        let conn = registry.register(tx);
        registry
            .subscribe(&conn.id(), Channel::Orderbook, Pair::new(pair))
            .unwrap();
        rx
    }

    fn as_json(frame: Outbound) -> Value {
        match frame {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_broadcast() {
        let f = fixture(StubEngine::default());
        let mut rx = subscriber(&f.registry, "BTC-USD");
        let pair = Pair::new("BTC-USD");

        assert!(f.throttler.notify(pair.clone()));
        for _ in 0..14 {
            tokio::time::advance(Duration::from_millis(1)).await;
            assert!(!f.throttler.notify(pair.clone()));
        }

        let msg = as_json(rx.recv().await.unwrap());
        assert_eq!(msg["type"], "orderbook");
        assert_eq!(msg["pair"], "BTC-USD");
        assert_eq!(msg["data"]["bids"].as_array().unwrap().len(), 10);
        assert_eq!(msg["data"]["asks"].as_array().unwrap().len(), 10);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(f.engine.depth_calls.load(Ordering::Relaxed), 1);
        assert_eq!(
            f.engine.levels_requested.lock().unwrap().as_slice(),
            &[Some(10)]
        );

        let exported = f.metrics.export();
        assert_eq!(exported["orderbook_events_received"], 15);
        assert_eq!(exported["orderbook_events_coalesced"], 14);
        assert_eq!(exported["orderbook_broadcasts"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_after_fire() {
        let f = fixture(StubEngine::default());
        let mut rx = subscriber(&f.registry, "BTC-USD");
        let pair = Pair::new("BTC-USD");

        f.throttler.notify(pair.clone());
        rx.recv().await.unwrap();
        assert!(!f.throttler.is_scheduled(&pair));

        assert!(f.throttler.notify(pair.clone()));
        rx.recv().await.unwrap();
        assert_eq!(f.engine.depth_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_failure_skips_broadcast() {
        let f = fixture(StubEngine::failing());
        let mut rx = subscriber(&f.registry, "BTC-USD");
        let pair = Pair::new("BTC-USD");

        f.throttler.notify(pair.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx.try_recv().is_err());
        assert!(!f.throttler.is_scheduled(&pair));
        assert_eq!(f.metrics.export()["engine_query_failures"], 1);

        f.engine.fail.store(false, Ordering::Relaxed);
        assert!(f.throttler.notify(pair));
        assert_eq!(as_json(rx.recv().await.unwrap())["type"], "orderbook");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let f = fixture(StubEngine::default());
        let mut rx = subscriber(&f.registry, "BTC-USD");

        f.throttler.notify(Pair::new("BTC-USD"));
        f.throttler.notify(Pair::new("ETH-USD"));
        assert_eq!(f.throttler.cancel_all(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(f.engine.depth_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_after_cancel_is_ignored() {
        let f = fixture(StubEngine::default());
        let mut rx = subscriber(&f.registry, "BTC-USD");
        let pair = Pair::new("BTC-USD");

        f.throttler.cancel_all();
        assert!(!f.throttler.notify(pair.clone()));
        assert!(!f.throttler.is_scheduled(&pair));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(f.engine.depth_calls.load(Ordering::Relaxed), 0);
        assert_eq!(f.metrics.export()["orderbook_events_received"], 0);
    }
}
