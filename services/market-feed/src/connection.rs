//! One accepted client link.
//!
//! A [`Connection`] never touches the socket directly. It pushes [`Outbound`]
//! frames into a bounded queue that the socket writer task drains, so every
//! send from timers and engine callbacks is non-blocking. Forced closure is
//! signalled through a watch channel that the socket reader selects on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::codec::{self, now_millis, OutboundMessage};
use crate::error::{FeedError, Result};
use crate::subscription::SubscriptionTable;

/// Opaque connection identifier, unique per accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame handed to the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-encoded JSON text; shared across all recipients of a broadcast.
    Text(Arc<str>),
    /// Transport-level liveness probe.
    Ping,
    /// Close the socket and stop writing.
    Close,
}

/// State for a single connected client.
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    /// Cleared when a probe is sent, set again by any probe response.
    alive: AtomicBool,
    subscriptions: Mutex<SubscriptionTable>,
    closed: watch::Sender<bool>,
    connected_at: i64,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            tx,
            alive: AtomicBool::new(true),
            subscriptions: Mutex::new(SubscriptionTable::new()),
            closed,
            connected_at: now_millis(),
        }
    }

    /// Build a connection together with the receiving end of its queue.
    pub fn channel(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Arc::new(Self::new(tx)), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    /// Encode and queue a message for this connection only.
    pub fn send(&self, message: &OutboundMessage) -> Result<()> {
        let text = codec::encode(message)?;
        self.send_text(Arc::from(text))
    }

    /// Queue an already-encoded frame.
    pub fn send_text(&self, text: Arc<str>) -> Result<()> {
        self.push(Outbound::Text(text))
    }

    /// Queue a transport-level liveness probe.
    pub fn probe(&self) -> Result<()> {
        self.push(Outbound::Ping)
    }

    fn push(&self, frame: Outbound) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FeedError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => FeedError::ChannelClosed,
        })
    }

    /// Record a probe response.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Mark a probe as outstanding. Returns whether the previous probe had
    /// been answered.
    pub fn mark_pending(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Force the transport closed. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            let _ = self.tx.try_send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that flips to `true` once [`close`](Self::close) is called.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Lock this connection's subscription table.
    pub fn subscriptions(&self) -> MutexGuard<'_, SubscriptionTable> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("closed", &self.is_closed())
            .finish()
    }
}
