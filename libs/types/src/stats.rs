//! Aggregate engine statistics
//!
//! Answer to the engine's `stats()` query, pushed to `metrics` subscribers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine-wide counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Orders accepted since start.
    pub total_orders: u64,
    /// Orders currently resting on any book.
    pub active_orders: u64,
    /// Trades executed since start.
    pub total_trades: u64,
    /// Quote-denominated traded volume since start.
    pub total_volume: Decimal,
    /// Number of pairs with a book.
    pub pairs: u64,
    /// Time of the most recent trade, epoch milliseconds.
    pub last_trade_at: Option<i64>,
}
