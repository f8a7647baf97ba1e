//! Inbound request handling for one connection.

use std::sync::Arc;

use tracing::{debug, warn};
use types::ids::Pair;

use crate::codec::{self, ClientRequest, OutboundMessage, ServerMessage};
use crate::connection::Connection;
use crate::engine::MarketEngine;
use crate::metrics::FeedMetrics;
use crate::registry::ConnectionRegistry;
use crate::subscription::Channel;

/// Applies client requests to the registry and queues the replies.
pub struct SessionHandler {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<dyn MarketEngine>,
    metrics: Arc<FeedMetrics>,
    snapshot_depth: Option<usize>,
}

impl SessionHandler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<dyn MarketEngine>,
        metrics: Arc<FeedMetrics>,
        snapshot_depth: Option<usize>,
    ) -> Self {
        Self {
            registry,
            engine,
            metrics,
            snapshot_depth,
        }
    }

    /// Handle one inbound text frame. Never fails: malformed input gets an
    /// `error` reply and the connection stays open.
    pub fn handle_text(&self, conn: &Connection, text: &str) {
        match codec::decode(text) {
            Ok(request) => self.handle_request(conn, request),
            Err(e) => {
                self.metrics.record_decode_error();
                debug!(connection_id = %conn.id(), error = %e, "Rejected client message");
                self.reply(conn, ServerMessage::invalid_format());
            }
        }
    }

    /// Binary frames are accepted when they carry UTF-8 JSON.
    pub fn handle_bytes(&self, conn: &Connection, data: &[u8]) {
        match std::str::from_utf8(data) {
            Ok(text) => self.handle_text(conn, text),
            Err(e) => {
                self.metrics.record_decode_error();
                debug!(connection_id = %conn.id(), error = %e, "Rejected non-UTF-8 binary frame");
                self.reply(conn, ServerMessage::invalid_format());
            }
        }
    }

    pub fn handle_request(&self, conn: &Connection, request: ClientRequest) {
        match request {
            ClientRequest::Subscribe { channel, pair } => self.subscribe(conn, channel, pair),
            ClientRequest::Unsubscribe { channel, pair } => {
                if let Err(e) = self.registry.unsubscribe(&conn.id(), channel, &pair) {
                    debug!(connection_id = %conn.id(), error = %e, "Unsubscribe on unregistered connection");
                }
                self.reply(conn, ServerMessage::Unsubscribed { channel, pair });
            }
            ClientRequest::Ping => self.reply(conn, ServerMessage::Pong),
        }
    }

    /// Record the subscription, confirm it, and for `orderbook`/`metrics`
    /// follow up with the current snapshot so the client starts from a full
    /// view instead of waiting for the next broadcast.
    fn subscribe(&self, conn: &Connection, channel: Channel, pair: Pair) {
        let result = self
            .registry
            .subscribe_with(&conn.id(), channel, pair.clone(), |conn| {
                self.reply(
                    conn,
                    ServerMessage::Subscribed {
                        channel,
                        pair: pair.clone(),
                    },
                );
                if let Some(snapshot) = self.initial_snapshot(channel, &pair) {
                    self.reply(conn, snapshot);
                }
            });

        match result {
            Ok(added) => {
                debug!(connection_id = %conn.id(), channel = %channel, pair = %pair, added, "Subscribed");
            }
            Err(e) => {
                debug!(connection_id = %conn.id(), error = %e, "Subscribe on unregistered connection");
            }
        }
    }

    fn initial_snapshot(&self, channel: Channel, pair: &Pair) -> Option<ServerMessage> {
        match channel {
            Channel::Orderbook => match self.engine.depth(pair, self.snapshot_depth) {
                Ok(data) => Some(ServerMessage::Orderbook {
                    pair: pair.clone(),
                    data,
                }),
                Err(e) => {
                    self.metrics.record_engine_failure();
                    warn!(pair = %pair, error = %e, "Depth query failed, no snapshot on subscribe");
                    None
                }
            },
            Channel::Metrics => {
                self.metrics.record_stats_query();
                match self.engine.stats() {
                    Ok(data) => Some(ServerMessage::Metrics { data }),
                    Err(e) => {
                        self.metrics.record_engine_failure();
                        warn!(error = %e, "Stats query failed, no snapshot on subscribe");
                        None
                    }
                }
            }
            Channel::Trades | Channel::Ticker => None,
        }
    }

    fn reply(&self, conn: &Connection, body: ServerMessage) {
        let kind = body.kind();
        match conn.send(&OutboundMessage::new(body)) {
            Ok(()) => self.metrics.record_sent(1),
            Err(e) => {
                self.metrics.record_drop();
                debug!(connection_id = %conn.id(), kind, error = %e, "Reply not queued");
            }
        }
    }
}
