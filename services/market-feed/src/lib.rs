//! Market Feed Service
//!
//! Real-time distribution layer of the venue: fans matching-engine events
//! out to WebSocket clients by channel and pair.
//!
//! - Trades are batched per pair (at most 10 per message, at most ~16ms late)
//! - Order-book changes are coalesced per pair into one depth snapshot per
//!   16ms window
//! - Engine statistics are pushed every second to `metrics` subscribers
//! - Silent clients are evicted by a 30s heartbeat
//!
//! # Architecture
//!
//! ```text
//!   MarketEngine ──events──► FeedService
//!        ▲                      │
//!        │ depth / stats        ├─► TradeBatcher ─────────┐
//!        │                      ├─► OrderBookThrottler ───┤
//!        └──────────────────────┼─► StatsBroadcaster ─────┼─► ConnectionRegistry ─► clients
//!                               └─► LivenessMonitor ──────┘
//! ```

pub mod batcher;
pub mod codec;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod liveness;
pub mod logging;
pub mod metrics;
pub mod order_book;
pub mod registry;
pub mod replay;
pub mod server;
pub mod service;
pub mod session;
pub mod stats_broadcast;
pub mod subscription;
pub mod throttle;

pub use config::FeedConfig;
pub use engine::MarketEngine;
pub use error::{FeedError, Result};
pub use events::EngineEvent;
pub use service::FeedService;

// Library version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
