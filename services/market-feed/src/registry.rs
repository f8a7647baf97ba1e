//! Connection registry: every live connection and what it listens to.
//!
//! Backed by a `DashMap` so the socket tasks, engine callbacks and timers can
//! all use it concurrently. Each connection's subscription table sits behind
//! its own mutex, so a subscriber scan sees every table in a consistent state.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::ids::Pair;

use crate::codec::{self, OutboundMessage};
use crate::connection::{Connection, ConnectionId, Outbound};
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::subscription::Channel;

/// Registry of connected clients.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    metrics: Arc<FeedMetrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<FeedMetrics>) -> Self {
        Self {
            connections: DashMap::new(),
            metrics,
        }
    }

    /// Create and store a connection writing into `tx`, with no
    /// subscriptions and liveness set to alive.
    pub fn register(&self, tx: mpsc::Sender<Outbound>) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(tx));
        self.connections.insert(connection.id(), connection.clone());
        self.metrics.record_accept();
        debug!(connection_id = %connection.id(), "Connection registered");
        connection
    }

    /// Remove a connection and all its subscription state. Idempotent.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, conn)| conn);
        if removed.is_some() {
            self.metrics.record_close();
            debug!(connection_id = %id, "Connection removed");
        }
        removed
    }

    /// Force-close a connection's transport and remove it.
    pub fn evict(&self, id: &ConnectionId) -> bool {
        match self.remove(id) {
            Some(conn) => {
                conn.close();
                self.metrics.record_eviction();
                info!(connection_id = %id, "Connection evicted");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|r| r.clone())
    }

    /// Add `pair` to the connection's set for `channel`. Returns false when
    /// it was already there.
    pub fn subscribe(&self, id: &ConnectionId, channel: Channel, pair: Pair) -> Result<bool> {
        self.subscribe_with(id, channel, pair, |_| {})
    }

    /// Subscribe, then run `on_subscribed` while the subscription table is
    /// still locked.
    ///
    /// Broadcasts scan tables under the same lock, so anything `on_subscribed`
    /// queues on the connection lands ahead of the first broadcast that
    /// matches the new subscription.
    pub fn subscribe_with(
        &self,
        id: &ConnectionId,
        channel: Channel,
        pair: Pair,
        on_subscribed: impl FnOnce(&Connection),
    ) -> Result<bool> {
        let conn = self.get(id).ok_or(FeedError::ConnectionNotFound(*id))?;
        let mut table = conn.subscriptions();
        let added = table.insert(channel, pair);
        on_subscribed(&*conn);
        drop(table);
        Ok(added)
    }

    /// Remove `pair` from the connection's set for `channel`. Returns false
    /// when it was not subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, channel: Channel, pair: &Pair) -> Result<bool> {
        let conn = self.get(id).ok_or(FeedError::ConnectionNotFound(*id))?;
        let removed = conn.subscriptions().remove(channel, pair);
        Ok(removed)
    }

    /// Every connection that should receive a `channel` message for `pair`.
    ///
    /// For `metrics` every connection holding the channel matches.
    pub fn subscribers_of(&self, channel: Channel, pair: &Pair) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().subscriptions().matches(channel, pair))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every connection holding `channel` for any pair.
    pub fn subscribers_of_channel(&self, channel: Channel) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().subscriptions().has_channel(channel))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn has_subscribers(&self, channel: Channel) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.value().subscriptions().has_channel(channel))
    }

    /// Visit every connection.
    ///
    /// Iterates over a snapshot, so `f` may remove connections.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Connection>)) {
        let snapshot: Vec<Arc<Connection>> =
            self.connections.iter().map(|r| r.value().clone()).collect();
        for conn in &snapshot {
            f(conn);
        }
    }

    /// Deliver `message` to every subscriber of `channel`/`pair`.
    ///
    /// Returns the number of connections that accepted the frame.
    pub fn broadcast(&self, channel: Channel, pair: &Pair, message: &OutboundMessage) -> usize {
        let recipients = self.subscribers_of(channel, pair);
        self.deliver(&recipients, message)
    }

    /// Encode `message` once and queue it on each recipient.
    ///
    /// A full queue drops the frame for that connection only; a closed queue
    /// removes the connection.
    pub fn deliver(&self, recipients: &[Arc<Connection>], message: &OutboundMessage) -> usize {
        if recipients.is_empty() {
            return 0;
        }

        let text: Arc<str> = match codec::encode(message) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(kind = message.body().kind(), error = %e, "Failed to encode broadcast message");
                return 0;
            }
        };

        let mut delivered = 0;
        for conn in recipients {
            match conn.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(FeedError::ChannelFull) => {
                    self.metrics.record_drop();
                    debug!(connection_id = %conn.id(), kind = message.body().kind(), "Outbound queue full, dropping message");
                }
                Err(e) => {
                    debug!(connection_id = %conn.id(), error = %e, "Send failed, removing connection");
                    self.remove(&conn.id());
                }
            }
        }

        self.metrics.record_sent(delivered as u64);
        delivered
    }

    /// Close every connection and empty the registry.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|r| *r.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some(conn) = self.remove(&id) {
                conn.close();
                closed += 1;
            }
        }
        closed
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Total channel/pair entries across all connections.
    pub fn subscription_count(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.value().subscriptions().len())
            .sum()
    }
}
