// =============================================================================
// Risk Weights — per-source weighting with missing-source renormalisation
// =============================================================================
//
// Weights are validated exactly once, at construction: every weight finite
// and >= 0, and the three summing to 1.0 within WEIGHT_SUM_EPSILON. Invalid
// weights are rejected, never silently rescaled.
//
// When sources are missing for a postal code, the weights of the present
// sources are rescaled proportionally so they again sum to 1.0.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::AggregationError;
use crate::types::SignalSource;

/// Tolerance on the sum-to-one invariant.
pub const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// Validated weights for the three signal sources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskWeights {
    weather: f64,
    stock: f64,
    traffic: f64,
}

impl RiskWeights {
    /// Validate and build a weight set.
    pub fn new(weather: f64, stock: f64, traffic: f64) -> Result<Self, AggregationError> {
        for (source, w) in [
            (SignalSource::Weather, weather),
            (SignalSource::Stock, stock),
            (SignalSource::Traffic, traffic),
        ] {
            if !w.is_finite() {
                return Err(AggregationError::InvalidWeights(format!(
                    "{source} weight {w} is not finite"
                )));
            }
            if w < 0.0 {
                return Err(AggregationError::InvalidWeights(format!(
                    "{source} weight {w} is negative"
                )));
            }
        }

        let weights = Self {
            weather,
            stock,
            traffic,
        };
        let sum = weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(AggregationError::InvalidWeights(format!(
                "weights sum to {sum}, expected 1.0 (±{WEIGHT_SUM_EPSILON})"
            )));
        }
        Ok(weights)
    }

    /// Weight configured for `source`.
    pub fn weight(&self, source: SignalSource) -> f64 {
        match source {
            SignalSource::Weather => self.weather,
            SignalSource::Stock => self.stock,
            SignalSource::Traffic => self.traffic,
        }
    }

    pub fn sum(&self) -> f64 {
        self.weather + self.stock + self.traffic
    }

    /// Redistribute the weight of absent sources proportionally across the
    /// `present` ones.
    ///
    /// Returns `None` when nothing is present or every present source has
    /// zero weight, since no distribution can then sum to 1.0.
    pub fn renormalize(&self, present: &[SignalSource]) -> Option<BTreeMap<SignalSource, f64>> {
        let mut selected: BTreeMap<SignalSource, f64> = BTreeMap::new();
        for &source in present {
            selected.insert(source, self.weight(source));
        }

        let total: f64 = selected.values().sum();
        if total.is_nan() || total <= 0.0 {
            return None;
        }

        for w in selected.values_mut() {
            *w /= total;
        }
        Some(selected)
    }
}

impl Default for RiskWeights {
    /// 40 % weather, 30 % stock, 30 % traffic.
    fn default() -> Self {
        Self {
            weather: 0.4,
            stock: 0.3,
            traffic: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_weights_are_valid() {
        let d = RiskWeights::default();
        assert!(RiskWeights::new(d.weather, d.stock, d.traffic).is_ok());
        assert!((d.sum() - 1.0).abs() < WEIGHT_SUM_EPSILON);
    }

    #[test]
    fn sum_off_by_more_than_epsilon_is_rejected() {
        let err = RiskWeights::new(0.4, 0.3, 0.31).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidWeights(_)));
    }

    #[test]
    fn sum_within_epsilon_is_accepted() {
        assert!(RiskWeights::new(0.4, 0.3, 0.3 + 5e-7).is_ok());
    }

    #[test]
    fn negative_weight_is_rejected() {
        assert!(RiskWeights::new(1.2, -0.2, 0.0).is_err());
    }

    #[test]
    fn nan_weight_is_rejected() {
        assert!(RiskWeights::new(f64::NAN, 0.5, 0.5).is_err());
    }

    #[test]
    fn renormalize_with_traffic_missing() {
        let w = RiskWeights::new(0.4, 0.3, 0.3).unwrap();
        let r = w
            .renormalize(&[SignalSource::Weather, SignalSource::Stock])
            .unwrap();
        assert_eq!(r.len(), 2);
        assert!((r[&SignalSource::Weather] - 0.4 / 0.7).abs() < 1e-12);
        assert!((r[&SignalSource::Stock] - 0.3 / 0.7).abs() < 1e-12);
        assert!((r.values().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn renormalize_single_source_gets_everything() {
        let w = RiskWeights::default();
        let r = w.renormalize(&[SignalSource::Traffic]).unwrap();
        assert!((r[&SignalSource::Traffic] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn renormalize_all_present_is_identity() {
        let w = RiskWeights::new(0.5, 0.2, 0.3).unwrap();
        let r = w.renormalize(&SignalSource::ALL).unwrap();
        for s in SignalSource::ALL {
            assert!((r[&s] - w.weight(s)).abs() < 1e-12);
        }
    }

    #[test]
    fn renormalize_nothing_present() {
        assert!(RiskWeights::default().renormalize(&[]).is_none());
    }

    #[test]
    fn renormalize_only_zero_weight_present() {
        let w = RiskWeights::new(1.0, 0.0, 0.0).unwrap();
        assert!(w.renormalize(&[SignalSource::Stock]).is_none());
    }

    proptest! {
        #[test]
        fn valid_weights_always_sum_to_one(a in 0.0f64..1.0, b in 0.0f64..1.0, c in 0.0f64..1.0) {
            prop_assume!(a + b + c > 1e-3);
            let total = a + b + c;
            let w = RiskWeights::new(a / total, b / total, c / total).unwrap();
            prop_assert!((w.sum() - 1.0).abs() <= WEIGHT_SUM_EPSILON);
        }

        #[test]
        fn invalid_sum_is_always_rejected(a in 0.0f64..1.0, b in 0.0f64..1.0, c in 0.0f64..1.0) {
            prop_assume!((a + b + c - 1.0).abs() > 1e-5);
            prop_assert!(RiskWeights::new(a, b, c).is_err());
        }

        #[test]
        fn renormalized_subsets_sum_to_one(
            a in 0.01f64..1.0, b in 0.01f64..1.0, c in 0.01f64..1.0,
            mask in 1u8..8,
        ) {
            let total = a + b + c;
            let w = RiskWeights::new(a / total, b / total, c / total).unwrap();
            let present: Vec<SignalSource> = SignalSource::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, s)| *s)
                .collect();
            let r = w.renormalize(&present).unwrap();
            prop_assert_eq!(r.len(), present.len());
            prop_assert!((r.values().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }
}
