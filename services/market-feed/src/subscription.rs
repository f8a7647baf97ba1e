//! Per-connection subscription tables.
//!
//! A table maps a [`Channel`] to the set of pairs the connection wants on
//! that channel. A channel key never maps to an empty set: the key is removed
//! on the same call that removes its last pair.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use types::ids::Pair;

/// Channels available for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Batched trade executions, per pair.
    Trades,
    /// Throttled depth snapshots, per pair.
    Orderbook,
    /// Accepted for forward compatibility; nothing is published on it yet.
    Ticker,
    /// Engine-wide statistics; the pair dimension is ignored for delivery.
    Metrics,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Trades,
        Channel::Orderbook,
        Channel::Ticker,
        Channel::Metrics,
    ];

    /// Parse a wire channel name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trades" => Some(Channel::Trades),
            "orderbook" => Some(Channel::Orderbook),
            "ticker" => Some(Channel::Ticker),
            "metrics" => Some(Channel::Metrics),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Trades => "trades",
            Channel::Orderbook => "orderbook",
            Channel::Ticker => "ticker",
            Channel::Metrics => "metrics",
        }
    }

    /// Whether delivery on this channel depends on the pair.
    pub fn is_pair_scoped(&self) -> bool {
        !matches!(self, Channel::Metrics)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel → pairs mapping owned by one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionTable {
    entries: BTreeMap<Channel, BTreeSet<Pair>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair to a channel. Returns false if it was already present.
    pub fn insert(&mut self, channel: Channel, pair: Pair) -> bool {
        self.entries.entry(channel).or_default().insert(pair)
    }

    /// Remove a pair from a channel, dropping the channel once empty.
    /// Returns false if the pair was not subscribed.
    pub fn remove(&mut self, channel: Channel, pair: &Pair) -> bool {
        let Some(pairs) = self.entries.get_mut(&channel) else {
            return false;
        };
        let removed = pairs.remove(pair);
        if pairs.is_empty() {
            self.entries.remove(&channel);
        }
        removed
    }

    /// Whether a message for `channel`/`pair` should be delivered.
    ///
    /// For pair-independent channels only the presence of the channel counts.
    pub fn matches(&self, channel: Channel, pair: &Pair) -> bool {
        if channel.is_pair_scoped() {
            self.contains(channel, pair)
        } else {
            self.has_channel(channel)
        }
    }

    pub fn contains(&self, channel: Channel, pair: &Pair) -> bool {
        self.entries
            .get(&channel)
            .is_some_and(|pairs| pairs.contains(pair))
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.entries.contains_key(&channel)
    }

    /// Total channel/pair entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no channel maps to an empty set.
    pub fn is_compact(&self) -> bool {
        self.entries.values().all(|pairs| !pairs.is_empty())
    }
}
