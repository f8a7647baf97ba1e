//! The feed service: owns every component and wires engine events to them.
//!
//! ```text
//!  engine events ──► pump ──┬─► TradeBatcher ───────┐
//!                           └─► OrderBookThrottler ─┤
//!  StatsBroadcaster (1s) ───────────────────────────┼─► ConnectionRegistry ─► sockets
//!  LivenessMonitor (30s) ───────────────────────────┘
//!  socket reader ─► SessionHandler ─► registry / replies
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::ids::Pair;
use types::trade::Trade;

use crate::batcher::TradeBatcher;
use crate::codec::{now_millis, OutboundMessage, ServerMessage};
use crate::config::FeedConfig;
use crate::connection::{Connection, ConnectionId, Outbound};
use crate::engine::MarketEngine;
use crate::events::EngineEvent;
use crate::liveness::LivenessMonitor;
use crate::metrics::FeedMetrics;
use crate::registry::ConnectionRegistry;
use crate::session::SessionHandler;
use crate::stats_broadcast::StatsBroadcaster;
use crate::throttle::OrderBookThrottler;

pub struct FeedService {
    config: FeedConfig,
    metrics: Arc<FeedMetrics>,
    registry: Arc<ConnectionRegistry>,
    session: SessionHandler,
    batcher: Arc<TradeBatcher>,
    throttler: Arc<OrderBookThrottler>,
    stats: Arc<StatsBroadcaster>,
    liveness: Arc<LivenessMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl FeedService {
    pub fn new(engine: Arc<dyn MarketEngine>, config: FeedConfig) -> Arc<Self> {
        let config = config.sanitized();
        let metrics = Arc::new(FeedMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));

        let session = SessionHandler::new(
            registry.clone(),
            engine.clone(),
            metrics.clone(),
            config.snapshot_depth,
        );
        let batcher = Arc::new(TradeBatcher::new(
            registry.clone(),
            metrics.clone(),
            config.throttle_interval,
            config.max_trades_per_batch,
        ));
        let throttler = Arc::new(OrderBookThrottler::new(
            registry.clone(),
            engine.clone(),
            metrics.clone(),
            config.throttle_interval,
            config.orderbook_depth,
        ));
        let stats = Arc::new(StatsBroadcaster::new(
            registry.clone(),
            engine,
            metrics.clone(),
            config.metrics_interval,
        ));
        let liveness = Arc::new(LivenessMonitor::new(
            registry.clone(),
            config.heartbeat_interval,
        ));

        Arc::new(Self {
            config,
            metrics,
            registry,
            session,
            batcher,
            throttler,
            stats,
            liveness,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the event pump and both periodic timers. Only the first call
    /// has an effect.
    pub fn start(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Feed service already started");
            return;
        }

        let service = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                service.on_event(event);
            }
            debug!("Engine event stream ended");
        });

        let mut tasks = self.tasks();
        tasks.push(pump);
        tasks.push(tokio::spawn(self.liveness.clone().run()));
        tasks.push(tokio::spawn(self.stats.clone().run()));

        info!(
            throttle_ms = self.config.throttle_interval.as_millis() as u64,
            batch = self.config.max_trades_per_batch,
            depth = self.config.orderbook_depth,
            metrics_ms = self.config.metrics_interval.as_millis() as u64,
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            "Feed service started"
        );
    }

    /// Route one engine event. Events after shutdown are dropped.
    pub fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Trade(trade) => self.on_trade(trade),
            EngineEvent::OrderUpdated { pair } => self.on_order_updated(pair),
        }
    }

    pub fn on_trade(&self, trade: Trade) {
        if !self.stopped.load(Ordering::SeqCst) {
            if !self.batcher.push(trade) {
                debug!("Trade dropped after shutdown");
            }
        }
    }

    pub fn on_order_updated(&self, pair: Pair) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.throttler.notify(pair);
        }
    }

    /// Register a new client and queue its connection acknowledgement.
    pub fn connect(&self) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.config.client_buffer);
        let conn = self.registry.register(tx);

        let ack = OutboundMessage::new(ServerMessage::Connection {
            message: self.config.welcome_message.clone(),
        });
        match conn.send(&ack) {
            Ok(()) => self.metrics.record_sent(1),
            Err(e) => debug!(connection_id = %conn.id(), error = %e, "Connection ack not queued"),
        }

        info!(connection_id = %conn.id(), connections = self.registry.len(), "Client connected");
        (conn, rx)
    }

    /// Forget a client whose transport has gone away.
    pub fn disconnect(&self, id: &ConnectionId) {
        if let Some(conn) = self.registry.remove(id) {
            let session_ms = now_millis() - conn.connected_at();
            info!(connection_id = %id, session_ms, connections = self.registry.len(), "Client disconnected");
        }
    }

    /// Stop timers, drop buffered work and close every client.
    ///
    /// Pending trade batches are discarded, not flushed. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks().drain(..) {
            task.abort();
        }
        let throttles = self.throttler.cancel_all();
        let discarded = self.batcher.discard_all();
        let closed = self.registry.close_all();

        info!(
            closed,
            cancelled_broadcasts = throttles,
            discarded_trades = discarded,
            "Feed service stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> &SessionHandler {
        &self.session
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.metrics
    }
}
