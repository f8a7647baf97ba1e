//! Pull-style queries the feed makes against the matching engine.
//!
//! Both queries are synchronous and may fail; every caller treats a failure
//! as recoverable and only skips the broadcast that needed the answer.

use types::book::DepthSnapshot;
use types::errors::EngineError;
use types::ids::Pair;
use types::stats::EngineStats;

/// The matching engine as seen by the feed.
pub trait MarketEngine: Send + Sync {
    /// Depth snapshot for `pair`, at most `levels` per side. `None` lets the
    /// engine pick its default depth.
    fn depth(&self, pair: &Pair, levels: Option<usize>) -> Result<DepthSnapshot, EngineError>;

    /// Aggregate engine statistics.
    fn stats(&self) -> Result<EngineStats, EngineError>;
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use types::book::DepthLevel;
    use types::numeric::{Price, Quantity};

    /// Scripted engine: fixed-size books for any pair, counted queries,
    /// optional failure.
    #[derive(Default)]
    pub(crate) struct StubEngine {
        pub depth_calls: AtomicU64,
        pub stats_calls: AtomicU64,
        pub fail: AtomicBool,
        pub levels_requested: Mutex<Vec<Option<usize>>>,
    }

    impl StubEngine {
        pub(crate) fn failing() -> Self {
            let engine = Self::default();
            engine.fail.store(true, Ordering::Relaxed);
            engine
        }
    }

    impl MarketEngine for StubEngine {
        fn depth(&self, pair: &Pair, levels: Option<usize>) -> Result<DepthSnapshot, EngineError> {
            self.depth_calls.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut requested) = self.levels_requested.lock() {
                requested.push(levels);
            }
            if self.fail.load(Ordering::Relaxed) {
                return Err(EngineError::UnknownPair {
                    pair: pair.to_string(),
                });
            }

            let level = |price: u64| DepthLevel {
                price: Price::from_u64(price),
                quantity: Quantity::from_u64(1),
                order_count: 1,
            };
            let mut snapshot = DepthSnapshot::empty(pair.clone(), 0);
            snapshot.bids = (0..25).map(|i| level(1000 - i)).collect();
            snapshot.asks = (0..25).map(|i| level(1001 + i)).collect();
            snapshot.truncate(levels.unwrap_or(20));
            Ok(snapshot)
        }

        fn stats(&self) -> Result<EngineStats, EngineError> {
            self.stats_calls.fetch_add(1, Ordering::Relaxed);
            if self.fail.load(Ordering::Relaxed) {
                return Err(EngineError::Unavailable {
                    reason: "stub".to_string(),
                });
            }
            Ok(EngineStats {
                total_trades: 7,
                ..EngineStats::default()
            })
        }
    }
}
