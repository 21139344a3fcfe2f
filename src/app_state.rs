// =============================================================================
// Central Application State — RiskPulse
// =============================================================================
//
// Holds what survives between cycles: the latest score per postal code, a
// summary of the last cycle and the cycle counter. Shared across tasks via
// `Arc<AppState>`.
//
// Thread safety:
//   - Atomic counter for the cycle count.
//   - parking_lot::RwLock for the mutable collections.
//   - Configuration, weights and normalisation table are fixed at startup.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::AggregationError;
use crate::risk::{NormalizationTable, RiskAggregator, RiskScore};
use crate::runtime_config::RuntimeConfig;
use crate::types::SignalSource;

// =============================================================================
// Cycle Summary
// =============================================================================

/// Counts from the most recent completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scored: usize,
    pub failed: usize,
    pub dropped_readings: usize,
    pub failed_sources: Vec<SignalSource>,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub config: RuntimeConfig,
    pub aggregator: RiskAggregator,
    pub normalization: NormalizationTable,

    // ── Scores ──────────────────────────────────────────────────────────
    /// Latest score per postal code. A newer cycle's score supersedes the
    /// previous one; a postal code that fails keeps its last good score.
    latest_scores: RwLock<HashMap<String, RiskScore>>,

    // ── Cycle tracking ──────────────────────────────────────────────────
    cycle_count: AtomicU64,
    last_cycle: RwLock<Option<CycleSummary>>,

    /// Instant when the pipeline was started.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build state from a loaded config. Fails if the weights are invalid.
    pub fn new(config: RuntimeConfig) -> Result<Self, AggregationError> {
        let weights = config.risk_weights()?;
        Ok(Self {
            aggregator: RiskAggregator::new(weights),
            normalization: config.normalization.clone(),
            config,
            latest_scores: RwLock::new(HashMap::new()),
            cycle_count: AtomicU64::new(0),
            last_cycle: RwLock::new(None),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Scores ──────────────────────────────────────────────────────────

    /// Store `scores`, keeping whichever score per postal code is newest.
    /// Returns how many entries were replaced or added.
    pub fn publish(&self, scores: &[RiskScore]) -> usize {
        let mut latest = self.latest_scores.write();
        let mut applied = 0;
        for score in scores {
            let newer = latest
                .get(&score.postal_code)
                .map_or(true, |current| score.computed_at >= current.computed_at);
            if newer {
                latest.insert(score.postal_code.clone(), score.clone());
                applied += 1;
            }
        }
        applied
    }

    pub fn latest(&self, postal_code: &str) -> Option<RiskScore> {
        self.latest_scores.read().get(postal_code).cloned()
    }

    /// Every stored score, ordered by postal code.
    pub fn latest_scores(&self) -> Vec<RiskScore> {
        let mut scores: Vec<RiskScore> = self.latest_scores.read().values().cloned().collect();
        scores.sort_by(|a, b| a.postal_code.cmp(&b.postal_code));
        scores
    }

    // ── Cycles ──────────────────────────────────────────────────────────

    /// Record a finished cycle and return the new cycle count.
    pub fn record_cycle(&self, summary: CycleSummary) -> u64 {
        *self.last_cycle.write() = Some(summary);
        self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::SeqCst)
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.read().clone()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskLevel;
    use chrono::Duration;
    use std::collections::{BTreeMap, BTreeSet};

    fn score(postal_code: &str, composite: f64, at: DateTime<Utc>) -> RiskScore {
        RiskScore {
            postal_code: postal_code.into(),
            computed_at: at,
            composite,
            risk_level: RiskLevel::from_composite(composite),
            contributing_sources: BTreeSet::from([SignalSource::Weather]),
            per_source_breakdown: BTreeMap::from([(SignalSource::Weather, composite)]),
        }
    }

    #[test]
    fn invalid_weights_are_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.weights.traffic = 0.9;
        assert!(matches!(
            AppState::new(cfg),
            Err(AggregationError::InvalidWeights(_))
        ));
    }

    #[test]
    fn newer_scores_supersede_older() {
        let state = AppState::new(RuntimeConfig::default()).unwrap();
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(15);

        assert_eq!(state.publish(&[score("H3A", 0.2, t0), score("H2T", 0.4, t0)]), 2);
        assert_eq!(state.publish(&[score("H3A", 0.6, t1)]), 1);
        // A late, older result does not overwrite.
        assert_eq!(state.publish(&[score("H3A", 0.1, t0)]), 0);

        let h3a = state.latest("H3A").unwrap();
        assert!((h3a.composite - 0.6).abs() < f64::EPSILON);
        assert!((state.latest("H2T").unwrap().composite - 0.4).abs() < f64::EPSILON);
        assert!(state.latest("H8N").is_none());

        let codes: Vec<String> = state.latest_scores().into_iter().map(|s| s.postal_code).collect();
        assert_eq!(codes, vec!["H2T", "H3A"]);
    }

    #[test]
    fn cycle_counter_increments() {
        let state = AppState::new(RuntimeConfig::default()).unwrap();
        assert_eq!(state.cycle_count(), 0);
        assert!(state.last_cycle().is_none());

        let now = Utc::now();
        let n = state.record_cycle(CycleSummary {
            cycle_id: "c1".into(),
            started_at: now,
            finished_at: now,
            scored: 3,
            failed: 1,
            dropped_readings: 0,
            failed_sources: vec![SignalSource::Stock],
        });
        assert_eq!(n, 1);
        assert_eq!(state.cycle_count(), 1);
        assert_eq!(state.last_cycle().unwrap().scored, 3);
    }
}
