//! Per-pair trade batching.
//!
//! Trades are buffered per pair and leave as one `trades` message when either
//! the buffer reaches `max_trades_per_batch` (flushed synchronously by the
//! push that filled it) or `throttle_interval` has elapsed since the first
//! buffered trade (flushed by a one-shot timer).
//!
//! Each pair is a two-state machine: no entry (idle) or an entry holding
//! trades plus exactly one armed timer (scheduled). Timers carry the
//! generation they were armed for, so a timer that lost a race with a
//! size-triggered flush finds a newer generation and does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use types::ids::Pair;
use types::trade::Trade;

use crate::codec::{OutboundMessage, ServerMessage};
use crate::metrics::FeedMetrics;
use crate::registry::ConnectionRegistry;
use crate::subscription::Channel;

struct PendingTrades {
    trades: Vec<Trade>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BatcherState {
    pending: HashMap<Pair, PendingTrades>,
    next_generation: u64,
    /// Set by `discard_all`; later trades are dropped.
    closed: bool,
}

/// Buffers trades per pair and flushes them as bounded batches.
pub struct TradeBatcher {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<FeedMetrics>,
    interval: Duration,
    max_batch: usize,
    state: Mutex<BatcherState>,
}

impl TradeBatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<FeedMetrics>,
        interval: Duration,
        max_batch: usize,
    ) -> Self {
        Self {
            registry,
            metrics,
            interval,
            max_batch: max_batch.max(1),
            state: Mutex::new(BatcherState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer one trade. Returns false when the batcher has been discarded
    /// and the trade was dropped.
    ///
    /// Must be called from within a tokio runtime: the first trade of a
    /// batch arms a timer task.
    pub fn push(self: &Arc<Self>, trade: Trade) -> bool {
        let pair = trade.pair.clone();

        let batch = {
            let mut state = self.state();
            if state.closed {
                return false;
            }
            self.metrics.record_trade();
            let len = {
                let entry = state
                    .pending
                    .entry(pair.clone())
                    .or_insert_with(|| PendingTrades {
                        trades: Vec::with_capacity(self.max_batch),
                        generation: 0,
                        timer: None,
                    });
                entry.trades.push(trade);
                entry.trades.len()
            };

            if len >= self.max_batch {
                self.take_batch(&mut state, &pair)
            } else {
                if len == 1 {
                    self.arm(&mut state, &pair);
                }
                None
            }
        };

        if let Some(trades) = batch {
            self.publish(pair, trades);
        }
        true
    }

    /// Flush up to one batch for `pair` right away. Returns the number of
    /// trades flushed.
    pub fn flush(self: &Arc<Self>, pair: &Pair) -> usize {
        let batch = {
            let mut state = self.state();
            self.take_batch(&mut state, pair)
        };
        match batch {
            Some(trades) => {
                let count = trades.len();
                self.publish(pair.clone(), trades);
                count
            }
            None => 0,
        }
    }

    /// Drop every pending buffer without flushing, cancel their timers and
    /// refuse later trades. Returns the number of trades discarded.
    pub fn discard_all(&self) -> usize {
        let mut state = self.state();
        state.closed = true;
        let mut discarded = 0;
        for (_, mut entry) in state.pending.drain() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            discarded += entry.trades.len();
        }
        discarded
    }

    /// Trades currently buffered for `pair`.
    pub fn pending_len(&self, pair: &Pair) -> usize {
        self.state()
            .pending
            .get(pair)
            .map(|entry| entry.trades.len())
            .unwrap_or(0)
    }

    /// Pairs with a buffered batch.
    pub fn pending_pairs(&self) -> usize {
        self.state().pending.len()
    }

    /// Remove the oldest `max_batch` trades for `pair`.
    ///
    /// Leftovers keep the entry alive with a freshly armed timer; an emptied
    /// entry is removed and its timer cancelled.
    fn take_batch(self: &Arc<Self>, state: &mut BatcherState, pair: &Pair) -> Option<Vec<Trade>> {
        let entry = state.pending.get_mut(pair)?;
        if entry.trades.is_empty() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            state.pending.remove(pair);
            return None;
        }

        let take = entry.trades.len().min(self.max_batch);
        let batch: Vec<Trade> = entry.trades.drain(..take).collect();

        if entry.trades.is_empty() {
            if let Some(mut entry) = state.pending.remove(pair) {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
        } else {
            self.arm(state, pair);
        }

        Some(batch)
    }

    fn arm(self: &Arc<Self>, state: &mut BatcherState, pair: &Pair) {
        state.next_generation += 1;
        let generation = state.next_generation;

        let Some(entry) = state.pending.get_mut(pair) else {
            return;
        };
        if let Some(previous) = entry.timer.take() {
            previous.abort();
        }
        entry.generation = generation;

        let batcher = Arc::clone(self);
        let timer_pair = pair.clone();
        let deadline = Instant::now() + self.interval;
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            batcher.on_timer(&timer_pair, generation);
        }));
    }

    fn on_timer(self: &Arc<Self>, pair: &Pair, generation: u64) {
        let batch = {
            let mut state = self.state();
            match state.pending.get_mut(pair) {
                Some(entry) if entry.generation == generation => {
                    // This task is the timer; release its handle before
                    // take_batch so it is not aborted mid-flush.
                    entry.timer = None;
                    self.take_batch(&mut state, pair)
                }
                _ => None,
            }
        };

        if let Some(trades) = batch {
            self.publish(pair.clone(), trades);
        }
    }

    fn publish(&self, pair: Pair, trades: Vec<Trade>) {
        let count = trades.len();
        self.metrics.record_trade_batch();

        let message = OutboundMessage::new(ServerMessage::Trades {
            pair: pair.clone(),
            data: trades,
        });
        let delivered = self.registry.broadcast(Channel::Trades, &pair, &message);
        debug!(pair = %pair, trades = count, delivered, "Flushed trade batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use types::numeric::Price;
    use types::order::Side;

    fn trade(pair: &str, price: u64) -> Trade {
        Trade::new(
            Pair::new(pair),
            Side::BUY,
            Price::from_u64(price),
            "1".parse().unwrap(),
            0,
        )
    }

    fn setup(max_batch: usize) -> (Arc<TradeBatcher>, Arc<ConnectionRegistry>, Arc<FeedMetrics>) {
        let metrics = Arc::new(FeedMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let batcher = Arc::new(TradeBatcher::new(
            registry.clone(),
            metrics.clone(),
            Duration::from_millis(16),
            max_batch,
        ));
        (batcher, registry, metrics)
    }

    fn subscriber(registry: &ConnectionRegistry, pair: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(64);
        let conn = registry.register(tx);
        registry
            .subscribe(&conn.id(), Channel::Trades, Pair::new(pair))
            .unwrap();
        rx
    }

    fn as_json(frame: Outbound) -> Value {
        match frame {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    fn batch_prices(value: &Value) -> Vec<String> {
        value["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["price"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch() {
        let (batcher, registry, _) = setup(10);
        let mut rx = subscriber(&registry, "BTC-USD");
        let start = Instant::now();

        for price in [100, 101, 102] {
            batcher.push(trade("BTC-USD", price));
        }
        assert_eq!(batcher.pending_len(&Pair::new("BTC-USD")), 3);

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        let msg = as_json(rx.recv().await.unwrap());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(16), "flushed early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(18), "flushed late: {:?}", elapsed);

        assert_eq!(msg["type"], "trades");
        assert_eq!(msg["pair"], "BTC-USD");
        assert_eq!(batch_prices(&msg), vec!["100", "101", "102"]);
        assert_eq!(batcher.pending_pairs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_cap_flushes_synchronously() {
        let (batcher, registry, metrics) = setup(10);
        let mut rx = subscriber(&registry, "BTC-USD");

        for price in 0..25 {
            batcher.push(trade("BTC-USD", 100 + price));
        }

        let first = as_json(rx.try_recv().unwrap());
        let second = as_json(rx.try_recv().unwrap());
        assert_eq!(batch_prices(&first).len(), 10);
        assert_eq!(batch_prices(&second).len(), 10);
        assert_eq!(batch_prices(&first)[0], "100");
        assert_eq!(batch_prices(&second)[0], "110");
        assert!(rx.try_recv().is_err());

        let third = as_json(rx.recv().await.unwrap());
        assert_eq!(batch_prices(&third), vec!["120", "121", "122", "123", "124"]);
        assert_eq!(metrics.export()["trade_batches_flushed"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_double_flush() {
        let (batcher, registry, metrics) = setup(2);
        let mut rx = subscriber(&registry, "BTC-USD");

        batcher.push(trade("BTC-USD", 1));
        batcher.push(trade("BTC-USD", 2));
        assert_eq!(batch_prices(&as_json(rx.try_recv().unwrap())), vec!["1", "2"]);

        tokio::time::advance(Duration::from_millis(8)).await;
        batcher.push(trade("BTC-USD", 3));

        let msg = as_json(rx.recv().await.unwrap());
        assert_eq!(batch_prices(&msg), vec!["3"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.export()["trade_batches_flushed"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairs_are_independent() {
        let (batcher, registry, _) = setup(10);
        let mut btc = subscriber(&registry, "BTC-USD");
        let mut eth = subscriber(&registry, "ETH-USD");

        batcher.push(trade("BTC-USD", 1));
        batcher.push(trade("BTC-USD", 2));

        let msg = as_json(btc.recv().await.unwrap());
        assert_eq!(msg["pair"], "BTC-USD");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(eth.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_cancels_timers() {
        let (batcher, registry, _) = setup(10);
        let mut rx = subscriber(&registry, "BTC-USD");

        batcher.push(trade("BTC-USD", 1));
        batcher.push(trade("ETH-USD", 1));
        assert_eq!(batcher.discard_all(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(batcher.pending_pairs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_discard_is_dropped() {
        let (batcher, registry, metrics) = setup(10);
        let mut rx = subscriber(&registry, "BTC-USD");

        batcher.discard_all();
        assert!(!batcher.push(trade("BTC-USD", 1)));
        assert_eq!(batcher.pending_pairs(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.export()["trades_received"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush() {
        let (batcher, registry, _) = setup(10);
        let mut rx = subscriber(&registry, "BTC-USD");

        batcher.push(trade("BTC-USD", 1));
        assert_eq!(batcher.flush(&Pair::new("BTC-USD")), 1);
        assert_eq!(batcher.flush(&Pair::new("BTC-USD")), 0);
        assert_eq!(batch_prices(&as_json(rx.try_recv().unwrap())), vec!["1"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
