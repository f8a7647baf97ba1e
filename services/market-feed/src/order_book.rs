//! Reference in-process order book engine.
//!
//! Keeps one aggregated book per pair, answers the feed's `depth`/`stats`
//! queries and publishes an [`EngineEvent`] for every change. It does no
//! matching of its own: fills are applied as commands against a named
//! resting maker order. Used by the binary's `--replay` mode and by tests.
//!
//! Uses `BTreeMap` so levels iterate in price order; all arithmetic is
//! `Decimal`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use types::book::{DepthLevel, DepthSnapshot};
use types::errors::EngineError;
use types::ids::{OrderId, Pair};
use types::numeric::{Price, Quantity};
use types::order::Side;
use types::stats::EngineStats;
use types::trade::Trade;

use crate::codec::now_millis;
use crate::engine::MarketEngine;
use crate::events::EngineEvent;

/// Levels per side when a depth query does not ask for a specific count.
pub const DEFAULT_DEPTH: usize = 20;

/// Why a book command was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookError {
    #[error("order {0} already rests on the book")]
    DuplicateOrder(OrderId),

    #[error("order {0} is not on the book")]
    UnknownOrder(OrderId),

    #[error("quantity must be positive")]
    InvalidQuantity,
}

/// One mutation of the engine's books.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BookCommand {
    /// Rest a new order.
    Add {
        pair: Pair,
        order_id: OrderId,
        side: Side,
        price: Price,
        quantity: Quantity,
    },
    /// Remove a resting order and whatever quantity it has left.
    Cancel { pair: Pair, order_id: OrderId },
    /// Execute `quantity` against a resting maker order at its price.
    Fill {
        pair: Pair,
        maker_order_id: OrderId,
        quantity: Quantity,
        #[serde(default)]
        taker_order_id: Option<OrderId>,
    },
}

impl BookCommand {
    pub fn pair(&self) -> &Pair {
        match self {
            BookCommand::Add { pair, .. }
            | BookCommand::Cancel { pair, .. }
            | BookCommand::Fill { pair, .. } => pair,
        }
    }
}

#[derive(Debug, Clone)]
struct PriceLevel {
    price: Price,
    total_quantity: Decimal,
    order_count: u32,
}

impl PriceLevel {
    fn is_empty(&self) -> bool {
        self.total_quantity <= Decimal::ZERO || self.order_count == 0
    }

    fn to_depth(&self) -> DepthLevel {
        DepthLevel {
            price: self.price,
            quantity: Quantity::new(self.total_quantity),
            order_count: self.order_count,
        }
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    side: Side,
    price: Price,
    remaining: Decimal,
}

/// Execution against a resting order, as seen from the taker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub taker_side: Side,
    pub price: Price,
    pub quantity: Quantity,
}

/// Aggregated book for a single pair.
///
/// Bids are read highest price first, asks lowest price first.
#[derive(Debug, Clone)]
pub struct OrderBookState {
    pair: Pair,
    bids: BTreeMap<Decimal, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    orders: HashMap<OrderId, RestingOrder>,
}

impl OrderBookState {
    pub fn new(pair: Pair) -> Self {
        Self {
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    fn levels_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, PriceLevel> {
        match side {
            Side::BUY => &mut self.bids,
            Side::SELL => &mut self.asks,
        }
    }

    pub fn add(
        &mut self,
        order_id: OrderId,
        side: Side,
        price: Price,
        quantity: Quantity,
    ) -> Result<(), BookError> {
        if quantity.as_decimal() <= Decimal::ZERO {
            return Err(BookError::InvalidQuantity);
        }
        if self.orders.contains_key(&order_id) {
            return Err(BookError::DuplicateOrder(order_id));
        }

        let qty = quantity.as_decimal();
        self.levels_mut(side)
            .entry(price.as_decimal())
            .and_modify(|level| {
                level.total_quantity += qty;
                level.order_count += 1;
            })
            .or_insert(PriceLevel {
                price,
                total_quantity: qty,
                order_count: 1,
            });

        self.orders.insert(
            order_id,
            RestingOrder {
                side,
                price,
                remaining: qty,
            },
        );
        Ok(())
    }

    /// Remove a resting order. Returns the quantity it still had.
    pub fn cancel(&mut self, order_id: OrderId) -> Result<Quantity, BookError> {
        let order = self
            .orders
            .remove(&order_id)
            .ok_or(BookError::UnknownOrder(order_id))?;

        self.reduce_level(order.side, order.price, order.remaining, true);
        Ok(Quantity::new(order.remaining))
    }

    /// Fill up to `quantity` of a resting order. The executed quantity is
    /// capped at what the order has left; a fully filled order leaves the
    /// book.
    pub fn fill(&mut self, maker_order_id: OrderId, quantity: Quantity) -> Result<Execution, BookError> {
        if quantity.as_decimal() <= Decimal::ZERO {
            return Err(BookError::InvalidQuantity);
        }
        let order = self
            .orders
            .get_mut(&maker_order_id)
            .ok_or(BookError::UnknownOrder(maker_order_id))?;

        let executed = quantity.as_decimal().min(order.remaining);
        order.remaining -= executed;
        let (side, price, done) = (order.side, order.price, order.remaining <= Decimal::ZERO);
        if done {
            self.orders.remove(&maker_order_id);
        }
        self.reduce_level(side, price, executed, done);

        Ok(Execution {
            taker_side: side.opposite(),
            price,
            quantity: Quantity::new(executed),
        })
    }

    fn reduce_level(&mut self, side: Side, price: Price, quantity: Decimal, remove_order: bool) {
        let levels = self.levels_mut(side);
        let key = price.as_decimal();
        if let Some(level) = levels.get_mut(&key) {
            level.total_quantity = (level.total_quantity - quantity).max(Decimal::ZERO);
            if remove_order {
                level.order_count = level.order_count.saturating_sub(1);
            }
            if level.is_empty() {
                levels.remove(&key);
            }
        }
    }

    /// Depth snapshot with at most `max_levels` per side, best first.
    pub fn depth_snapshot(&self, max_levels: usize) -> DepthSnapshot {
        DepthSnapshot {
            pair: self.pair.clone(),
            bids: self
                .bids
                .values()
                .rev()
                .take(max_levels)
                .map(PriceLevel::to_depth)
                .collect(),
            asks: self
                .asks
                .values()
                .take(max_levels)
                .map(PriceLevel::to_depth)
                .collect(),
            timestamp: now_millis(),
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.values().next_back().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.values().next().map(|l| l.price)
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Resting orders on both sides.
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_orders: u64,
    total_trades: u64,
    total_volume: Decimal,
    last_trade_at: Option<i64>,
}

/// Multi-pair book engine that publishes its changes.
pub struct BookEngine {
    books: RwLock<BTreeMap<Pair, OrderBookState>>,
    counters: Mutex<Counters>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl BookEngine {
    /// Create an engine and the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            books: RwLock::new(BTreeMap::new()),
            counters: Mutex::new(Counters::default()),
            events,
        };
        (engine, rx)
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one command. A fill returns the resulting trade.
    ///
    /// Events go out after the book lock is released: a trade first, then
    /// the order update for its pair.
    pub fn apply(&self, command: BookCommand) -> Result<Option<Trade>, BookError> {
        let pair = command.pair().clone();

        let trade = {
            let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
            match command {
                BookCommand::Add {
                    pair,
                    order_id,
                    side,
                    price,
                    quantity,
                } => {
                    books
                        .entry(pair.clone())
                        .or_insert_with(|| OrderBookState::new(pair))
                        .add(order_id, side, price, quantity)?;
                    self.counters().total_orders += 1;
                    None
                }
                BookCommand::Cancel { pair, order_id } => {
                    books
                        .get_mut(&pair)
                        .ok_or(BookError::UnknownOrder(order_id))?
                        .cancel(order_id)?;
                    None
                }
                BookCommand::Fill {
                    pair,
                    maker_order_id,
                    quantity,
                    taker_order_id,
                } => {
                    let execution = books
                        .get_mut(&pair)
                        .ok_or(BookError::UnknownOrder(maker_order_id))?
                        .fill(maker_order_id, quantity)?;

                    let trade = Trade::new(
                        pair,
                        execution.taker_side,
                        execution.price,
                        execution.quantity,
                        now_millis(),
                    )
                    .with_orders(maker_order_id, taker_order_id.unwrap_or_default());

                    let mut counters = self.counters();
                    counters.total_trades += 1;
                    counters.total_volume += trade.trade_value();
                    counters.last_trade_at = Some(trade.timestamp);
                    Some(trade)
                }
            }
        };

        if let Some(trade) = &trade {
            self.publish(EngineEvent::Trade(trade.clone()));
        }
        self.publish(EngineEvent::OrderUpdated { pair });
        Ok(trade)
    }

    fn publish(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped, engine event discarded");
        }
    }

    /// Resting orders on `pair`, or zero for a pair never seen.
    pub fn order_count(&self, pair: &Pair) -> usize {
        self.books
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pair)
            .map(OrderBookState::order_count)
            .unwrap_or(0)
    }
}

impl MarketEngine for BookEngine {
    /// A pair with no book yet answers with an empty snapshot.
    fn depth(&self, pair: &Pair, levels: Option<usize>) -> Result<DepthSnapshot, EngineError> {
        let levels = levels.unwrap_or(DEFAULT_DEPTH);
        let books = self.books.read().unwrap_or_else(PoisonError::into_inner);
        Ok(books
            .get(pair)
            .map(|book| book.depth_snapshot(levels))
            .unwrap_or_else(|| DepthSnapshot::empty(pair.clone(), now_millis())))
    }

    fn stats(&self) -> Result<EngineStats, EngineError> {
        let (pairs, active_orders) = {
            let books = self.books.read().unwrap_or_else(PoisonError::into_inner);
            let active: usize = books.values().map(OrderBookState::order_count).sum();
            (books.len() as u64, active as u64)
        };
        let counters = self.counters();
        Ok(EngineStats {
            total_orders: counters.total_orders,
            active_orders,
            total_trades: counters.total_trades,
            total_volume: counters.total_volume,
            pairs,
            last_trade_at: counters.last_trade_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn btc() -> Pair {
        Pair::new("BTC-USD")
    }

    fn qty(s: &str) -> Quantity {
        Quantity::from_str(s).unwrap()
    }

    fn add(order_id: OrderId, side: Side, price: u64, quantity: &str) -> BookCommand {
        BookCommand::Add {
            pair: btc(),
            order_id,
            side,
            price: Price::from_u64(price),
            quantity: qty(quantity),
        }
    }

    #[test]
    fn test_levels_aggregate_and_sort() {
        let mut book = OrderBookState::new(btc());
        book.add(OrderId::new(), Side::BUY, Price::from_u64(49000), qty("1")).unwrap();
        book.add(OrderId::new(), Side::BUY, Price::from_u64(50000), qty("1")).unwrap();
        book.add(OrderId::new(), Side::BUY, Price::from_u64(50000), qty("2")).unwrap();
        book.add(OrderId::new(), Side::SELL, Price::from_u64(52000), qty("1")).unwrap();
        book.add(OrderId::new(), Side::SELL, Price::from_u64(51000), qty("1")).unwrap();

        assert_eq!(book.best_bid(), Some(Price::from_u64(50000)));
        assert_eq!(book.best_ask(), Some(Price::from_u64(51000)));

        let snapshot = book.depth_snapshot(10);
        assert_eq!(snapshot.bids.len(), 2);
        assert_eq!(snapshot.bids[0].quantity, qty("3"));
        assert_eq!(snapshot.bids[0].order_count, 2);
        assert!(snapshot.bids[0].price > snapshot.bids[1].price);
        assert!(snapshot.asks[0].price < snapshot.asks[1].price);

        let top = book.depth_snapshot(1);
        assert_eq!(top.bids.len(), 1);
        assert_eq!(top.asks.len(), 1);
    }

    #[test]
    fn test_partial_and_full_fill() {
        let mut book = OrderBookState::new(btc());
        let maker = OrderId::new();
        book.add(maker, Side::SELL, Price::from_u64(51000), qty("2.0")).unwrap();

        let execution = book.fill(maker, qty("0.5")).unwrap();
        assert_eq!(execution.taker_side, Side::BUY);
        assert_eq!(execution.price, Price::from_u64(51000));
        assert_eq!(book.depth_snapshot(10).asks[0].quantity, qty("1.5"));

        let execution = book.fill(maker, qty("5")).unwrap();
        assert_eq!(execution.quantity, qty("1.5"));
        assert_eq!(book.ask_depth(), 0);
        assert_eq!(book.order_count(), 0);
        assert_eq!(book.fill(maker, qty("1")), Err(BookError::UnknownOrder(maker)));
    }

    #[test]
    fn test_cancel_compresses_level() {
        let mut book = OrderBookState::new(btc());
        let a = OrderId::new();
        let b = OrderId::new();
        book.add(a, Side::BUY, Price::from_u64(50000), qty("1")).unwrap();
        book.add(b, Side::BUY, Price::from_u64(49000), qty("1")).unwrap();

        assert_eq!(book.cancel(a).unwrap(), qty("1"));
        assert_eq!(book.bid_depth(), 1);
        assert_eq!(book.best_bid(), Some(Price::from_u64(49000)));
        assert_eq!(book.cancel(a), Err(BookError::UnknownOrder(a)));
    }

    #[test]
    fn test_rejects_bad_adds() {
        let mut book = OrderBookState::new(btc());
        let id = OrderId::new();
        assert_eq!(
            book.add(id, Side::BUY, Price::from_u64(1), qty("0")),
            Err(BookError::InvalidQuantity)
        );
        book.add(id, Side::BUY, Price::from_u64(1), qty("1")).unwrap();
        assert_eq!(
            book.add(id, Side::BUY, Price::from_u64(1), qty("1")),
            Err(BookError::DuplicateOrder(id))
        );
    }

    #[test]
    fn test_engine_publishes_events() {
        let (engine, mut rx) = BookEngine::new();
        let maker = OrderId::new();

        engine.apply(add(maker, Side::SELL, 100, "2")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::order_updated("BTC-USD"));

        let trade = engine
            .apply(BookCommand::Fill {
                pair: btc(),
                maker_order_id: maker,
                quantity: qty("1"),
                taker_order_id: None,
            })
            .unwrap()
            .unwrap();
        assert_eq!(trade.side, Side::BUY);
        assert_eq!(trade.maker_order_id, maker);

        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::Trade(t) if t == trade));
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::order_updated("BTC-USD"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rejected_command_publishes_nothing() {
        let (engine, mut rx) = BookEngine::new();
        let result = engine.apply(BookCommand::Cancel {
            pair: btc(),
            order_id: OrderId::new(),
        });
        assert!(matches!(result, Err(BookError::UnknownOrder(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_engine_queries() {
        let (engine, _rx) = BookEngine::new();
        let maker = OrderId::new();
        for i in 0..30 {
            engine.apply(add(OrderId::new(), Side::BUY, 1000 - i, "1")).unwrap();
        }
        engine.apply(add(maker, Side::SELL, 2000, "1")).unwrap();
        engine
            .apply(BookCommand::Fill {
                pair: btc(),
                maker_order_id: maker,
                quantity: qty("1"),
                taker_order_id: None,
            })
            .unwrap();

        let depth = engine.depth(&btc(), None).unwrap();
        assert_eq!(depth.bids.len(), DEFAULT_DEPTH);
        assert!(depth.asks.is_empty());
        assert_eq!(engine.depth(&btc(), Some(5)).unwrap().bids.len(), 5);

        let unknown = engine.depth(&Pair::new("ETH-USD"), None).unwrap();
        assert!(unknown.bids.is_empty() && unknown.asks.is_empty());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.total_orders, 31);
        assert_eq!(stats.active_orders, 30);
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.total_volume, Decimal::from(2000));
        assert_eq!(stats.pairs, 1);
        assert!(stats.last_trade_at.is_some());
    }

    #[test]
    fn test_command_wire_shape() {
        let line = r#"{"op":"add","pair":"BTC-USD","order_id":"00000000-0000-0000-0000-000000000001","side":"buy","price":"50000","quantity":"0.5"}"#;
        let command: BookCommand = serde_json::from_str(line).unwrap();
        assert_eq!(command.pair(), &btc());
        assert!(matches!(command, BookCommand::Add { side: Side::BUY, .. }));
    }
}
