// =============================================================================
// Risk Module
// =============================================================================
//
// Turns heterogeneous, partially-available source readings into a bounded
// composite score per postal code:
// - Validated per-source weights with missing-source renormalisation
// - Per-source severity normalisation table
// - Confidence-weighted aggregation and batch scoring

pub mod aggregator;
pub mod normalize;
pub mod weights;

pub use aggregator::{aggregate, BatchOutcome, PostalCodeFailure, RiskAggregator, RiskScore};
pub use normalize::{NormalizationRule, NormalizationTable, SeverityCurve};
pub use weights::RiskWeights;
