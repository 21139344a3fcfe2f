// =============================================================================
// Signal Readings — what the collectors hand to the aggregator
// =============================================================================
//
// A collector produces a `RawObservation` in domain units (risk index, percent
// change, incident count). Normalising it through the per-source table yields
// an immutable `SignalReading` with a severity in [0, 1].
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;
use crate::risk::NormalizationTable;
use crate::types::SignalSource;

/// A single source value for one postal code, still in domain units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub source: SignalSource,
    pub postal_code: String,
    pub timestamp: DateTime<Utc>,
    pub raw_value: f64,
    pub confidence: f64,
}

/// A normalised, validated reading. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalReading {
    source: SignalSource,
    postal_code: String,
    timestamp: DateTime<Utc>,
    raw_value: f64,
    normalized_severity: f64,
    confidence: f64,
}

impl SignalReading {
    /// Build a reading from already-normalised values.
    ///
    /// Fails with `InvalidReading` if the raw value is not finite or the
    /// severity / confidence fall outside [0, 1].
    pub fn new(
        source: SignalSource,
        postal_code: impl Into<String>,
        timestamp: DateTime<Utc>,
        raw_value: f64,
        normalized_severity: f64,
        confidence: f64,
    ) -> Result<Self, AggregationError> {
        if !raw_value.is_finite() {
            return Err(AggregationError::invalid_reading(
                source,
                format!("raw value {raw_value} is not finite"),
            ));
        }
        if !(0.0..=1.0).contains(&normalized_severity) {
            return Err(AggregationError::invalid_reading(
                source,
                format!("severity {normalized_severity} outside [0, 1]"),
            ));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(AggregationError::invalid_reading(
                source,
                format!("confidence {confidence} outside [0, 1]"),
            ));
        }

        Ok(Self {
            source,
            postal_code: postal_code.into(),
            timestamp,
            raw_value,
            normalized_severity,
            confidence,
        })
    }

    /// Normalise a raw observation through `table`.
    pub fn from_observation(
        table: &NormalizationTable,
        obs: &RawObservation,
    ) -> Result<Self, AggregationError> {
        let severity = table.normalize(obs.source, obs.raw_value)?;
        Self::new(
            obs.source,
            obs.postal_code.clone(),
            obs.timestamp,
            obs.raw_value,
            severity,
            obs.confidence,
        )
    }

    pub fn source(&self) -> SignalSource {
        self.source
    }

    pub fn postal_code(&self) -> &str {
        &self.postal_code
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn raw_value(&self) -> f64 {
        self.raw_value
    }

    pub fn normalized_severity(&self) -> f64 {
        self.normalized_severity
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}
