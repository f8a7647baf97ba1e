//! Trade execution records
//!
//! A `Trade` is what the matching engine publishes for every fill. The feed
//! forwards it verbatim inside `trades` batches.

use crate::ids::{OrderId, Pair, TradeId};
use crate::numeric::{Price, Quantity};
use crate::order::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An executed trade between a resting maker order and an incoming taker order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub pair: Pair,

    // Trade details (from taker perspective)
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,

    // Counterparts
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,

    /// Execution time, epoch milliseconds
    pub timestamp: i64,
}

impl Trade {
    /// Create a new trade with fresh trade and order identifiers
    pub fn new(pair: Pair, side: Side, price: Price, quantity: Quantity, timestamp: i64) -> Self {
        Self {
            trade_id: TradeId::new(),
            pair,
            side,
            price,
            quantity,
            maker_order_id: OrderId::new(),
            taker_order_id: OrderId::new(),
            timestamp,
        }
    }

    /// Attach the counterpart order identifiers
    pub fn with_orders(mut self, maker_order_id: OrderId, taker_order_id: OrderId) -> Self {
        self.maker_order_id = maker_order_id;
        self.taker_order_id = taker_order_id;
        self
    }

    /// Calculate trade value (price × quantity)
    pub fn trade_value(&self) -> Decimal {
        self.quantity.as_decimal() * self.price.as_decimal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> Trade {
        Trade::new(
            Pair::new("BTC-USD"),
            Side::BUY,
            Price::from_u64(50000),
            "0.5".parse().unwrap(),
            1708123456789,
        )
    }

    #[test]
    fn test_trade_value() {
        assert_eq!(sample_trade().trade_value(), Decimal::from(25000));
    }

    #[test]
    fn test_trade_with_orders() {
        let maker = OrderId::new();
        let taker = OrderId::new();
        let trade = sample_trade().with_orders(maker, taker);
        assert_eq!(trade.maker_order_id, maker);
        assert_eq!(trade.taker_order_id, taker);
    }

    #[test]
    fn test_trade_json_shape() {
        let json = serde_json::to_value(sample_trade()).unwrap();
        assert_eq!(json["pair"], "BTC-USD");
        assert_eq!(json["side"], "buy");
        assert_eq!(json["price"], "50000");
        assert_eq!(json["quantity"], "0.5");
        assert_eq!(json["timestamp"], 1708123456789i64);
    }
}
