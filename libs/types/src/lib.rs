//! Types library for the market feed
//!
//! Core type definitions shared between the matching engine boundary and the
//! real-time distribution layer. Everything here is plain data: no I/O, no
//! timers, no locking.
//!
//! # Modules
//! - `ids`: Identifiers (OrderId, TradeId, Pair)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `order`: Order side
//! - `trade`: Executed trade records
//! - `book`: Depth snapshots
//! - `stats`: Aggregate engine statistics
//! - `errors`: Engine query error taxonomy

// Public modules
pub mod book;
pub mod errors;
pub mod ids;
pub mod numeric;
pub mod order;
pub mod stats;
pub mod trade;

// Library version constant
pub const LIB_VERSION: &str = "1.1.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::book::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::order::*;
    pub use crate::stats::*;
    pub use crate::trade::*;
}
