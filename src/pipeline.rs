// =============================================================================
// Pipeline — one scoring cycle
// =============================================================================
//
//   collect (3 sources, concurrent, time-bounded)
//     → normalise each observation (invalid readings dropped and recorded)
//     → aggregate per postal code
//     → publish into AppState (newer supersedes older)
//     → export to disk
//
// Nothing in a cycle is fatal: failed sources, dropped readings and postal
// codes without data are all reported in the `CycleReport`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::{AppState, CycleSummary};
use crate::collectors::{CollectionOutcome, Collectors, DistrictWeather, SourceFailure};
use crate::export;
use crate::risk::{BatchOutcome, NormalizationTable, PostalCodeFailure, RiskAggregator, RiskScore};
use crate::signals::{RawObservation, SignalReading};
use crate::types::SignalSource;

/// An observation rejected during normalisation.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedReading {
    pub source: SignalSource,
    pub postal_code: String,
    pub raw_value: f64,
    pub reason: String,
}

/// Everything that happened in one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scores: Vec<RiskScore>,
    pub failures: Vec<PostalCodeFailure>,
    pub source_failures: Vec<SourceFailure>,
    pub dropped_readings: Vec<DroppedReading>,
    /// Current and forecast weather risk per district.
    pub weather: Vec<DistrictWeather>,
}

impl CycleReport {
    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            cycle_id: self.cycle_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            scored: self.scores.len(),
            failed: self.failures.len(),
            dropped_readings: self.dropped_readings.len(),
            failed_sources: self.source_failures.iter().map(|f| f.source).collect(),
        }
    }
}

/// Normalise `observations` and score every postal code.
pub fn score_observations(
    observations: &[RawObservation],
    table: &NormalizationTable,
    aggregator: &RiskAggregator,
    postal_codes: &[String],
    at: DateTime<Utc>,
) -> (BatchOutcome, Vec<DroppedReading>) {
    let mut readings = Vec::with_capacity(observations.len());
    let mut dropped = Vec::new();

    for obs in observations {
        match SignalReading::from_observation(table, obs) {
            Ok(reading) => readings.push(reading),
            Err(e) => {
                warn!(
                    source = %obs.source,
                    postal_code = %obs.postal_code,
                    raw_value = obs.raw_value,
                    error = %e,
                    "reading dropped"
                );
                dropped.push(DroppedReading {
                    source: obs.source,
                    postal_code: obs.postal_code.clone(),
                    raw_value: obs.raw_value,
                    reason: e.to_string(),
                });
            }
        }
    }

    (aggregator.aggregate_batch(&readings, postal_codes, at), dropped)
}

/// Score, publish and export the observations collected for one cycle.
pub fn complete_cycle(
    state: &AppState,
    cycle_id: String,
    started_at: DateTime<Utc>,
    collected: CollectionOutcome,
) -> CycleReport {
    let postal_codes = state.config.postal_codes();
    let (batch, dropped_readings) = score_observations(
        &collected.observations,
        &state.normalization,
        &state.aggregator,
        &postal_codes,
        Utc::now(),
    );

    let superseded = state.publish(&batch.scores);

    let report = CycleReport {
        cycle_id,
        started_at,
        finished_at: Utc::now(),
        scores: batch.scores,
        failures: batch.failures,
        source_failures: collected.failures,
        dropped_readings,
        weather: collected.weather,
    };

    let count = state.record_cycle(report.summary());

    if let Some(dir) = &state.config.export_dir {
        if let Err(e) = export::export_cycle(dir, &report, &state.latest_scores()) {
            warn!(cycle_id = %report.cycle_id, error = %format!("{e:#}"), "cycle export failed");
        }
    }

    info!(
        cycle_id = %report.cycle_id,
        cycle = count,
        scored = report.scores.len(),
        published = superseded,
        failed = report.failures.len(),
        dropped = report.dropped_readings.len(),
        failed_sources = report.source_failures.len(),
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "cycle complete"
    );

    report
}

/// Run one full cycle: collect from every source, then score and publish.
pub async fn run_cycle(state: &AppState, collectors: &Collectors) -> CycleReport {
    let cycle_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    info!(cycle_id = %cycle_id, postal_codes = state.config.postal_codes().len(), "cycle started");

    let collected = collectors.collect(&state.config.districts).await;
    complete_cycle(state, cycle_id, started_at, collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::District;

    fn obs(source: SignalSource, postal_code: &str, raw_value: f64, confidence: f64) -> RawObservation {
        RawObservation {
            source,
            postal_code: postal_code.into(),
            timestamp: Utc::now(),
            raw_value,
            confidence,
        }
    }

    fn small_config(export_dir: Option<std::path::PathBuf>) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.districts = vec![
            District::new("Downtown", 45.5017, -73.5673, &["H3A"]),
            District::new("Plateau", 45.5200, -73.5800, &["H2T"]),
        ];
        cfg.export_dir = export_dir;
        cfg
    }

    #[test]
    fn missing_traffic_renormalises_weather_and_stock() {
        let cfg = RuntimeConfig::default();
        let aggregator = RiskAggregator::new(cfg.risk_weights().unwrap());
        // Weather index 8/10 → 0.8; basket −2 % → 0.2; traffic missing.
        let observations = vec![
            obs(SignalSource::Weather, "H3A", 8.0, 1.0),
            obs(SignalSource::Stock, "H3A", -2.0, 1.0),
        ];
        let (batch, dropped) = score_observations(
            &observations,
            &cfg.normalization,
            &aggregator,
            &["H3A".to_string()],
            Utc::now(),
        );
        assert!(dropped.is_empty());
        assert_eq!(batch.scores.len(), 1);
        let s = &batch.scores[0];
        assert!((s.composite - (0.4 * 0.8 + 0.3 * 0.2) / 0.7).abs() < 1e-9);
        assert!(!s.contributing_sources.contains(&SignalSource::Traffic));
    }

    #[test]
    fn invalid_observations_are_dropped_not_fatal() {
        let cfg = RuntimeConfig::default();
        let aggregator = RiskAggregator::new(cfg.risk_weights().unwrap());
        let observations = vec![
            obs(SignalSource::Weather, "H3A", 42.0, 1.0),
            obs(SignalSource::Traffic, "H3A", 3.0, 1.0),
            obs(SignalSource::Stock, "H2T", -1.0, 1.5),
        ];
        let (batch, dropped) = score_observations(
            &observations,
            &cfg.normalization,
            &aggregator,
            &["H3A".to_string(), "H2T".to_string()],
            Utc::now(),
        );
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].source, SignalSource::Weather);
        assert_eq!(batch.scores.len(), 1);
        assert_eq!(batch.scores[0].postal_code, "H3A");
        assert!((batch.scores[0].composite - 0.5).abs() < 1e-9);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].postal_code, "H2T");
        assert_eq!(batch.failures[0].kind, "InsufficientData");
    }

    #[test]
    fn completed_cycle_publishes_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(small_config(Some(dir.path().to_path_buf()))).unwrap();

        let collected = CollectionOutcome {
            observations: vec![
                obs(SignalSource::Weather, "H3A", 5.0, 1.0),
                obs(SignalSource::Weather, "H2T", 2.0, 0.5),
            ],
            failures: vec![SourceFailure {
                source: SignalSource::Stock,
                reason: "ALPHAVANTAGE_API_KEY is not set".into(),
            }],
            ..Default::default()
        };
        let report = complete_cycle(&state, "c-1".into(), Utc::now(), collected);

        assert_eq!(report.scores.len(), 2);
        assert_eq!(report.source_failures.len(), 1);
        assert_eq!(state.cycle_count(), 1);
        assert_eq!(
            state.last_cycle().unwrap().failed_sources,
            vec![SignalSource::Stock]
        );
        assert!((state.latest("H3A").unwrap().composite - 0.5).abs() < 1e-9);
        assert!(dir.path().join(export::LATEST_FILE).exists());
    }

    #[test]
    fn failed_postal_code_keeps_previous_score() {
        let state = AppState::new(small_config(None)).unwrap();

        let first = CollectionOutcome {
            observations: vec![
                obs(SignalSource::Traffic, "H3A", 6.0, 1.0),
                obs(SignalSource::Traffic, "H2T", 0.0, 1.0),
            ],
            ..Default::default()
        };
        complete_cycle(&state, "c-1".into(), Utc::now(), first);

        let second = CollectionOutcome {
            observations: vec![obs(SignalSource::Traffic, "H2T", 3.0, 1.0)],
            ..Default::default()
        };
        let report = complete_cycle(&state, "c-2".into(), Utc::now(), second);

        assert_eq!(report.failures.len(), 1);
        assert!((state.latest("H3A").unwrap().composite - 1.0).abs() < 1e-9);
        assert!((state.latest("H2T").unwrap().composite - 0.5).abs() < 1e-9);
        assert_eq!(state.cycle_count(), 2);
    }
}
