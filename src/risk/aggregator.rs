// =============================================================================
// Risk Aggregator — confidence-weighted composite per postal code
// =============================================================================
//
// For the sources present for a postal code (at most one reading each):
//
//   composite = Σ w[s] · severity[s] · confidence[s]  /  Σ w[s] · confidence[s]
//
// where w is the configured weight renormalised over the present sources.
// Confidence is a soft down-weight, not a cutoff.
//
// Duplicate readings for a source: latest timestamp wins, then highest
// confidence, then the earliest in input order.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AggregationError;
use crate::risk::RiskWeights;
use crate::signals::SignalReading;
use crate::types::{RiskLevel, SignalSource};

/// Composite risk for one postal code in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub postal_code: String,
    pub computed_at: DateTime<Utc>,
    /// Composite severity in [0, 1].
    pub composite: f64,
    pub risk_level: RiskLevel,
    /// Sources that carried non-zero effective weight.
    pub contributing_sources: BTreeSet<SignalSource>,
    /// Each contributing source's normalised severity, before weighting.
    pub per_source_breakdown: BTreeMap<SignalSource, f64>,
}

/// A postal code that could not be scored this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostalCodeFailure {
    pub postal_code: String,
    pub kind: &'static str,
    pub message: String,
}

impl PostalCodeFailure {
    fn from_error(postal_code: &str, err: &AggregationError) -> Self {
        Self {
            postal_code: postal_code.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Scores and failures of a batch; one entry per postal code.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub scores: Vec<RiskScore>,
    pub failures: Vec<PostalCodeFailure>,
}

/// Keep one reading per source using the duplicate tie-break rules.
pub fn select_latest(readings: &[SignalReading]) -> BTreeMap<SignalSource, &SignalReading> {
    let mut chosen: BTreeMap<SignalSource, &SignalReading> = BTreeMap::new();
    for reading in readings {
        let replace = match chosen.get(&reading.source()) {
            Some(current) => supersedes(reading, current),
            None => true,
        };
        if replace {
            chosen.insert(reading.source(), reading);
        }
    }
    chosen
}

fn supersedes(candidate: &SignalReading, current: &SignalReading) -> bool {
    if candidate.timestamp() != current.timestamp() {
        return candidate.timestamp() > current.timestamp();
    }
    candidate.confidence() > current.confidence()
}

/// Aggregate the readings of a single postal code into a `RiskScore`.
///
/// Readings tagged with another postal code are ignored. Fails with
/// `InsufficientData` when no source carries any effective weight.
pub fn aggregate(
    readings: &[SignalReading],
    weights: &RiskWeights,
    postal_code: &str,
    computed_at: DateTime<Utc>,
) -> Result<RiskScore, AggregationError> {
    let own: Vec<SignalReading> = readings
        .iter()
        .filter(|r| r.postal_code() == postal_code)
        .cloned()
        .collect();
    if own.len() != readings.len() {
        debug!(
            postal_code,
            ignored = readings.len() - own.len(),
            "ignoring readings for other postal codes"
        );
    }

    let chosen = select_latest(&own);
    if chosen.is_empty() {
        return Err(AggregationError::insufficient(postal_code));
    }

    let present: Vec<SignalSource> = chosen.keys().copied().collect();
    let normalized = weights
        .renormalize(&present)
        .ok_or_else(|| AggregationError::insufficient(postal_code))?;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut contributing = BTreeSet::new();
    let mut breakdown = BTreeMap::new();

    for (source, reading) in &chosen {
        let effective = normalized[source] * reading.confidence();
        if effective <= 0.0 {
            continue;
        }
        numerator += effective * reading.normalized_severity();
        denominator += effective;
        contributing.insert(*source);
        breakdown.insert(*source, reading.normalized_severity());
    }

    if denominator.is_nan() || denominator <= 0.0 {
        return Err(AggregationError::insufficient(postal_code));
    }

    let composite = (numerator / denominator).clamp(0.0, 1.0);

    Ok(RiskScore {
        postal_code: postal_code.to_string(),
        computed_at,
        composite,
        risk_level: RiskLevel::from_composite(composite),
        contributing_sources: contributing,
        per_source_breakdown: breakdown,
    })
}

/// Holds validated weights and scores whole cycles.
#[derive(Debug, Clone)]
pub struct RiskAggregator {
    weights: RiskWeights,
}

impl RiskAggregator {
    pub fn new(weights: RiskWeights) -> Self {
        Self { weights }
    }

    pub fn aggregate(
        &self,
        readings: &[SignalReading],
        postal_code: &str,
        computed_at: DateTime<Utc>,
    ) -> Result<RiskScore, AggregationError> {
        aggregate(readings, &self.weights, postal_code, computed_at)
    }

    /// Score every postal code in `postal_codes` plus any that appear in
    /// `readings`. A failure for one postal code never affects the others.
    pub fn aggregate_batch(
        &self,
        readings: &[SignalReading],
        postal_codes: &[String],
        computed_at: DateTime<Utc>,
    ) -> BatchOutcome {
        let mut grouped: BTreeMap<&str, Vec<SignalReading>> = BTreeMap::new();
        for code in postal_codes {
            grouped.entry(code.as_str()).or_default();
        }
        for reading in readings {
            grouped
                .entry(reading.postal_code())
                .or_default()
                .push(reading.clone());
        }

        let mut outcome = BatchOutcome::default();
        for (postal_code, group) in grouped {
            match self.aggregate(&group, postal_code, computed_at) {
                Ok(score) => {
                    debug!(
                        postal_code,
                        composite = score.composite,
                        risk_level = %score.risk_level,
                        sources = ?score.contributing_sources,
                        "postal code scored"
                    );
                    outcome.scores.push(score);
                }
                Err(e) => {
                    warn!(postal_code, error = %e, "postal code not scored");
                    outcome
                        .failures
                        .push(PostalCodeFailure::from_error(postal_code, &e));
                }
            }
        }
        outcome
    }
}
