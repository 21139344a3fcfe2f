// =============================================================================
// Aggregation errors
// =============================================================================
//
// InsufficientData and InvalidReading are per-postal-code / per-reading and
// never abort a cycle. InvalidWeights is a configuration error and is fatal at
// startup.
// =============================================================================

use crate::types::SignalSource;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    /// No usable reading for a postal code in this cycle.
    #[error("insufficient data for postal code {postal_code}")]
    InsufficientData { postal_code: String },

    /// A reading outside the domain range of its source.
    #[error("invalid {signal} reading: {reason}")]
    InvalidReading { signal: SignalSource, reason: String },

    /// Weights are negative, non-finite or do not sum to 1.0.
    #[error("invalid risk weights: {0}")]
    InvalidWeights(String),
}

impl AggregationError {
    pub fn insufficient(postal_code: impl Into<String>) -> Self {
        Self::InsufficientData {
            postal_code: postal_code.into(),
        }
    }

    pub fn invalid_reading(signal: SignalSource, reason: impl Into<String>) -> Self {
        Self::InvalidReading {
            signal,
            reason: reason.into(),
        }
    }

    /// Short machine-readable tag used in exports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientData { .. } => "InsufficientData",
            Self::InvalidReading { .. } => "InvalidReading",
            Self::InvalidWeights(_) => "InvalidWeights",
        }
    }
}
