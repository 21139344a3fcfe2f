// =============================================================================
// Signals Module
// =============================================================================
//
// Reading types flowing from the collectors into the aggregator:
// - Raw observations in domain units and validated, normalised readings
// - Half-life confidence decay for stale source data

pub mod reading;
pub mod signal_decay;

pub use reading::{RawObservation, SignalReading};
pub use signal_decay::ConfidenceDecay;
