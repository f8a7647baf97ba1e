//! Observability counters for the feed service.
//!
//! Plain atomics, cheap enough to bump from every broadcast. Exported as a
//! sorted map for the `/health` endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Core counters for the feed service.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    // Connections
    pub connections_accepted: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_evicted: AtomicU64,

    // Delivery
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub decode_errors: AtomicU64,

    // Batching / throttling
    pub trades_received: AtomicU64,
    pub trade_batches_flushed: AtomicU64,
    pub orderbook_events_received: AtomicU64,
    pub orderbook_events_coalesced: AtomicU64,
    pub orderbook_broadcasts: AtomicU64,

    // Engine
    pub stats_queries: AtomicU64,
    pub metrics_broadcasts: AtomicU64,
    pub engine_query_failures: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.connections_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade(&self) {
        self.trades_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade_batch(&self) {
        self.trade_batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an order-book event; `coalesced` when a broadcast was already
    /// scheduled for its pair.
    pub fn record_orderbook_event(&self, coalesced: bool) {
        self.orderbook_events_received.fetch_add(1, Ordering::Relaxed);
        if coalesced {
            self.orderbook_events_coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_orderbook_broadcast(&self) {
        self.orderbook_broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stats_query(&self) {
        self.stats_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metrics_broadcast(&self) {
        self.metrics_broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_failure(&self) {
        self.engine_query_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Export counters keyed by name.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 14] = [
            ("connections_accepted", &self.connections_accepted),
            ("connections_closed", &self.connections_closed),
            ("connections_evicted", &self.connections_evicted),
            ("messages_sent", &self.messages_sent),
            ("messages_dropped", &self.messages_dropped),
            ("decode_errors", &self.decode_errors),
            ("trades_received", &self.trades_received),
            ("trade_batches_flushed", &self.trade_batches_flushed),
            ("orderbook_events_received", &self.orderbook_events_received),
            ("orderbook_events_coalesced", &self.orderbook_events_coalesced),
            ("orderbook_broadcasts", &self.orderbook_broadcasts),
            ("stats_queries", &self.stats_queries),
            ("metrics_broadcasts", &self.metrics_broadcasts),
            ("engine_query_failures", &self.engine_query_failures),
        ];

        counters
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = FeedMetrics::new();

        metrics.record_accept();
        metrics.record_accept();
        metrics.record_sent(5);
        metrics.record_drop();

        let exported = metrics.export();
        assert_eq!(exported["connections_accepted"], 2);
        assert_eq!(exported["messages_sent"], 5);
        assert_eq!(exported["messages_dropped"], 1);
    }

    #[test]
    fn test_orderbook_coalescing_counts() {
        let metrics = FeedMetrics::new();
        metrics.record_orderbook_event(false);
        metrics.record_orderbook_event(true);
        metrics.record_orderbook_event(true);

        let exported = metrics.export();
        assert_eq!(exported["orderbook_events_received"], 3);
        assert_eq!(exported["orderbook_events_coalesced"], 2);
    }

    #[test]
    fn test_export_lists_every_counter() {
        let exported = FeedMetrics::new().export();
        assert_eq!(exported.len(), 14);
        assert!(exported.values().all(|v| *v == 0));
    }
}
