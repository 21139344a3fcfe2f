// =============================================================================
// Confidence Decay — half-life freshness model for source readings
// =============================================================================
//
// A reading's confidence is scaled by 0.5^(age / half_life). Data observed in
// the future (clock skew) is treated as fresh. A non-positive half-life turns
// decay off.

use chrono::{DateTime, Utc};

/// Exponential (half-life) decay applied to reading confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceDecay {
    half_life_secs: f64,
}

impl ConfidenceDecay {
    /// Create a new decay model with the given half-life in seconds.
    pub fn new(half_life_secs: f64) -> Self {
        Self { half_life_secs }
    }

    /// Multiplicative factor in (0, 1] for data that is `age_secs` old.
    pub fn factor(&self, age_secs: f64) -> f64 {
        let disabled = self.half_life_secs.is_nan() || self.half_life_secs <= 0.0;
        if disabled || age_secs.is_nan() || age_secs <= 0.0 {
            return 1.0;
        }
        (-age_secs * (2.0_f64.ln()) / self.half_life_secs).exp()
    }

    /// Decay `confidence` by the age of `observed_at` relative to `now`.
    pub fn apply(&self, confidence: f64, observed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_secs = (now - observed_at).num_milliseconds() as f64 / 1000.0;
        (confidence * self.factor(age_secs)).clamp(0.0, 1.0)
    }
}

impl Default for ConfidenceDecay {
    fn default() -> Self {
        Self::new(3600.0) // 1-hour half-life
    }
}
