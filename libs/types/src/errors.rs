//! Error types for engine queries
//!
//! Both engine queries (`depth`, `stats`) may fail; callers treat every
//! variant as recoverable.

use thiserror::Error;

/// Failure of a pull-style engine query
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Unknown pair: {pair}")]
    UnknownPair { pair: String },

    #[error("Engine unavailable: {reason}")]
    Unavailable { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_pair_display() {
        let err = EngineError::UnknownPair {
            pair: "DOGE-USD".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown pair: DOGE-USD");
    }
}
