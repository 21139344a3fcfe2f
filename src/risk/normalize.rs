// =============================================================================
// Severity Normalisation — per-source strategy table
// =============================================================================
//
// Each source maps its domain unit onto a [0, 1] severity through a rule:
// a valid physical/domain range plus a curve. Values outside the range are
// rejected as `InvalidReading`; values inside are mapped and clamped.
//
// Default rules put the collectors' 0-10 / 0-3 risk scales on [0, 1]:
//   weather   risk index 0..10, severity = index / 10
//   stock     basket % change, 0 % => 0.0, -10 % => 1.0
//   traffic   incident count, 0 => 0.0, 6 or more => 1.0
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AggregationError;
use crate::types::SignalSource;

/// Which way a step ladder is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Higher raw values are worse.
    #[default]
    Rising,
    /// Lower raw values are worse.
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityStep {
    pub threshold: f64,
    pub severity: f64,
}

/// Mapping from a raw value to a severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeverityCurve {
    /// Linear ramp: `zero_at` maps to 0, `full_at` to 1. `full_at` may be
    /// below `zero_at` for sources where lower is worse.
    Linear { zero_at: f64, full_at: f64 },
    /// Threshold ladder: severity of the worst step crossed, 0 if none.
    Steps {
        #[serde(default)]
        direction: Direction,
        steps: Vec<SeverityStep>,
    },
}

impl SeverityCurve {
    fn evaluate(&self, raw: f64) -> f64 {
        match self {
            Self::Linear { zero_at, full_at } => {
                ((raw - zero_at) / (full_at - zero_at)).clamp(0.0, 1.0)
            }
            Self::Steps { direction, steps } => steps
                .iter()
                .filter(|s| match direction {
                    Direction::Rising => raw >= s.threshold,
                    Direction::Falling => raw <= s.threshold,
                })
                .map(|s| s.severity)
                .fold(0.0, f64::max)
                .clamp(0.0, 1.0),
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Self::Linear { zero_at, full_at } => {
                if !zero_at.is_finite() || !full_at.is_finite() {
                    return Err("linear curve endpoints must be finite".into());
                }
                if zero_at == full_at {
                    return Err(format!("linear curve has zero width at {zero_at}"));
                }
            }
            Self::Steps { steps, .. } => {
                if steps.is_empty() {
                    return Err("step curve has no steps".into());
                }
                for s in steps {
                    if !s.threshold.is_finite() {
                        return Err("step threshold must be finite".into());
                    }
                    if !(0.0..=1.0).contains(&s.severity) {
                        return Err(format!("step severity {} outside [0, 1]", s.severity));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Valid domain range plus severity curve for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRule {
    pub min: f64,
    pub max: f64,
    pub curve: SeverityCurve,
}

impl NormalizationRule {
    pub fn linear(min: f64, max: f64, zero_at: f64, full_at: f64) -> Self {
        Self {
            min,
            max,
            curve: SeverityCurve::Linear { zero_at, full_at },
        }
    }
}

/// Source → rule table consulted for every raw observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizationTable {
    rules: BTreeMap<SignalSource, NormalizationRule>,
}

impl NormalizationTable {
    /// An empty table; every source must be registered with `with_rule`.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Register (or replace) the rule for `source`.
    pub fn with_rule(mut self, source: SignalSource, rule: NormalizationRule) -> Self {
        self.rules.insert(source, rule);
        self
    }

    /// Map `raw_value` for `source` onto [0, 1].
    pub fn normalize(&self, source: SignalSource, raw_value: f64) -> Result<f64, AggregationError> {
        let rule = self.rules.get(&source).ok_or_else(|| {
            AggregationError::invalid_reading(source, "no normalization rule registered")
        })?;

        if !raw_value.is_finite() {
            return Err(AggregationError::invalid_reading(
                source,
                format!("raw value {raw_value} is not finite"),
            ));
        }
        if raw_value < rule.min || raw_value > rule.max {
            return Err(AggregationError::invalid_reading(
                source,
                format!(
                    "raw value {raw_value} outside valid range [{}, {}]",
                    rule.min, rule.max
                ),
            ));
        }

        Ok(rule.curve.evaluate(raw_value))
    }

    /// Check that every source has a well-formed rule.
    pub fn validate(&self) -> anyhow::Result<()> {
        for source in SignalSource::ALL {
            let rule = self
                .rules
                .get(&source)
                .ok_or_else(|| anyhow::anyhow!("no normalization rule for {source}"))?;
            if !(rule.min.is_finite() && rule.max.is_finite() && rule.min < rule.max) {
                anyhow::bail!(
                    "{source} rule has invalid range [{}, {}]",
                    rule.min,
                    rule.max
                );
            }
            rule.curve
                .check()
                .map_err(|e| anyhow::anyhow!("{source} rule: {e}"))?;
        }
        Ok(())
    }
}

impl Default for NormalizationTable {
    fn default() -> Self {
        Self::empty()
            .with_rule(
                SignalSource::Weather,
                NormalizationRule::linear(0.0, 10.0, 0.0, 10.0),
            )
            .with_rule(
                SignalSource::Stock,
                NormalizationRule::linear(-100.0, 100.0, 0.0, -10.0),
            )
            .with_rule(
                SignalSource::Traffic,
                NormalizationRule::linear(0.0, 100_000.0, 0.0, 6.0),
            )
    }
}
