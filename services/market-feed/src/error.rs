//! Feed error types.

use thiserror::Error;
use types::errors::EngineError;

use crate::codec::CodecError;
use crate::connection::ConnectionId;

/// Feed error type.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Inbound message could not be decoded, or outbound could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Depth or stats query failed.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Connection not registered (already closed or evicted).
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The connection's transport is gone.
    #[error("Connection channel closed")]
    ChannelClosed,

    /// The connection's outbound queue is full; the frame was dropped.
    #[error("Connection channel full")]
    ChannelFull,

    /// Socket / listener I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
