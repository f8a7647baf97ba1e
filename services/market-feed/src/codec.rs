//! Wire protocol: JSON text frames in both directions.
//!
//! Inbound frames are decoded into a [`ClientRequest`]; anything that is not
//! one of the three recognised intents comes back as a [`CodecError`] instead
//! of a panic. Outbound frames are [`OutboundMessage`]s: a [`ServerMessage`]
//! body flattened next to a `timestamp` in epoch milliseconds.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::book::DepthSnapshot;
use types::ids::Pair;
use types::stats::EngineStats;
use types::trade::Trade;

use crate::subscription::Channel;

/// Text of the `error` reply sent for any undecodable inbound frame.
pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format";

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Client → Server
// ============================================================================

/// A decoded, validated client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe { channel: Channel, pair: Pair },
    Unsubscribe { channel: Channel, pair: Pair },
    Ping,
}

/// Loose shape used for the first decoding pass; validation happens after.
#[derive(Debug, Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    pair: Option<String>,
}

/// Why an inbound frame was rejected.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<ClientRequest, CodecError> {
    let raw: RawClientMessage = serde_json::from_str(text)?;

    match raw.kind.as_str() {
        "subscribe" => {
            let (channel, pair) = channel_and_pair(raw.channel, raw.pair)?;
            Ok(ClientRequest::Subscribe { channel, pair })
        }
        "unsubscribe" => {
            let (channel, pair) = channel_and_pair(raw.channel, raw.pair)?;
            Ok(ClientRequest::Unsubscribe { channel, pair })
        }
        "ping" => Ok(ClientRequest::Ping),
        other => Err(CodecError::UnknownType(other.to_string())),
    }
}

fn channel_and_pair(
    channel: Option<String>,
    pair: Option<String>,
) -> Result<(Channel, Pair), CodecError> {
    let channel = channel
        .filter(|c| !c.is_empty())
        .ok_or(CodecError::MissingField("channel"))?;
    let channel = Channel::parse(&channel).ok_or(CodecError::UnknownChannel(channel))?;
    let pair = pair
        .and_then(Pair::try_new)
        .ok_or(CodecError::MissingField("pair"))?;
    Ok((channel, pair))
}

// ============================================================================
// Server → Client
// ============================================================================

/// Message body sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once when the connection is accepted.
    Connection { message: String },
    Subscribed { channel: Channel, pair: Pair },
    Unsubscribed { channel: Channel, pair: Pair },
    Error { message: String },
    Pong,
    /// One batch of trades for a pair, oldest first.
    Trades { pair: Pair, data: Vec<Trade> },
    /// Depth snapshot for a pair.
    Orderbook { pair: Pair, data: DepthSnapshot },
    /// Engine-wide statistics.
    Metrics { data: EngineStats },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connection { .. } => "connection",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
            ServerMessage::Trades { .. } => "trades",
            ServerMessage::Orderbook { .. } => "orderbook",
            ServerMessage::Metrics { .. } => "metrics",
        }
    }

    pub fn invalid_format() -> Self {
        ServerMessage::Error {
            message: INVALID_MESSAGE_FORMAT.to_string(),
        }
    }
}

/// Timestamped outbound message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(flatten)]
    body: ServerMessage,
    timestamp: i64,
}

impl OutboundMessage {
    /// Stamp a body with the current time.
    pub fn new(body: ServerMessage) -> Self {
        Self::at(body, now_millis())
    }

    pub fn at(body: ServerMessage, timestamp: i64) -> Self {
        Self { body, timestamp }
    }

    pub fn body(&self) -> &ServerMessage {
        &self.body
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(body: ServerMessage) -> Self {
        Self::new(body)
    }
}

/// Encode an outbound message as a JSON text frame.
pub fn encode(message: &OutboundMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}
