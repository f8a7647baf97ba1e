//! Events consumed from the matching engine.
//!
//! The engine publishes fire-and-forget notifications; the feed never
//! acknowledges them. Trades carry the full execution record, order updates
//! only need to name the pair whose book changed.

use serde::{Deserialize, Serialize};
use types::ids::Pair;
use types::trade::Trade;

/// Engine notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A trade was executed.
    Trade(Trade),
    /// An order on `pair` was added, changed, filled or cancelled.
    OrderUpdated { pair: Pair },
}

impl EngineEvent {
    pub fn order_updated(pair: impl Into<Pair>) -> Self {
        EngineEvent::OrderUpdated { pair: pair.into() }
    }

    /// The pair this event concerns.
    pub fn pair(&self) -> &Pair {
        match self {
            EngineEvent::Trade(trade) => &trade.pair,
            EngineEvent::OrderUpdated { pair } => pair,
        }
    }

    /// Event type label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            EngineEvent::Trade(_) => "trade",
            EngineEvent::OrderUpdated { .. } => "order_updated",
        }
    }
}

impl From<Trade> for EngineEvent {
    fn from(trade: Trade) -> Self {
        EngineEvent::Trade(trade)
    }
}
