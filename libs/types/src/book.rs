//! Order book depth snapshots
//!
//! A depth snapshot is the engine's answer to a `depth(pair, levels)` query:
//! aggregated price levels, best price first on each side.

use crate::ids::Pair;
use crate::numeric::{Price, Quantity};
use serde::{Deserialize, Serialize};

/// A single aggregated price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// The price of this level.
    pub price: Price,
    /// Total resting quantity at this price.
    pub quantity: Quantity,
    /// Number of orders resting at this level.
    pub order_count: u32,
}

/// Bounded view of resting interest for one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub pair: Pair,
    /// Bid levels in descending price order (best first).
    pub bids: Vec<DepthLevel>,
    /// Ask levels in ascending price order (best first).
    pub asks: Vec<DepthLevel>,
    /// Snapshot time, epoch milliseconds.
    pub timestamp: i64,
}

impl DepthSnapshot {
    /// Create an empty snapshot.
    pub fn empty(pair: Pair, timestamp: i64) -> Self {
        Self {
            pair,
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp,
        }
    }

    /// Keep at most `levels` levels on each side.
    pub fn truncate(&mut self, levels: usize) {
        self.bids.truncate(levels);
        self.asks.truncate(levels);
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first().map(|l| l.price)
    }

    /// Deepest side, in levels.
    pub fn depth(&self) -> usize {
        self.bids.len().max(self.asks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: u64) -> DepthLevel {
        DepthLevel {
            price: Price::from_u64(price),
            quantity: Quantity::from_u64(1),
            order_count: 1,
        }
    }

    #[test]
    fn test_truncate_both_sides() {
        let mut snap = DepthSnapshot::empty(Pair::new("BTC-USD"), 0);
        snap.bids = (0..15).map(|i| level(100 - i)).collect();
        snap.asks = (0..3).map(|i| level(101 + i)).collect();

        snap.truncate(10);
        assert_eq!(snap.bids.len(), 10);
        assert_eq!(snap.asks.len(), 3);
        assert_eq!(snap.depth(), 10);
        assert_eq!(snap.best_bid(), Some(Price::from_u64(100)));
        assert_eq!(snap.best_ask(), Some(Price::from_u64(101)));
    }
}
