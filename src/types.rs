// =============================================================================
// Shared types used across the RiskPulse pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// The independent feeds a composite score is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalSource {
    Weather,
    Stock,
    Traffic,
}

impl SignalSource {
    /// Every known source, in a stable order.
    pub const ALL: [SignalSource; 3] = [Self::Weather, Self::Stock, Self::Traffic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weather => "weather",
            Self::Stock => "stock",
            Self::Traffic => "traffic",
        }
    }
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorical label derived from a composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Minimal,
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a composite in [0, 1] onto a level.
    pub fn from_composite(composite: f64) -> Self {
        if composite >= 0.7 {
            Self::Critical
        } else if composite >= 0.5 {
            Self::High
        } else if composite >= 0.3 {
            Self::Moderate
        } else if composite >= 0.1 {
            Self::Low
        } else {
            Self::Minimal
        }
    }

    /// Operational actions suggested for claims teams at this level.
    pub fn recommendations(&self) -> &'static [&'static str] {
        match self {
            Self::Critical => &[
                "Deploy additional claims adjusters",
                "Activate emergency response protocols",
                "Notify high-risk policyholders",
                "Increase call center capacity",
            ],
            Self::High => &[
                "Monitor weather conditions closely",
                "Pre-position claims resources",
                "Review high-risk policies",
            ],
            Self::Moderate => &[
                "Standard monitoring procedures",
                "Review daily risk assessment",
            ],
            Self::Low | Self::Minimal => &["Normal operations"],
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minimal => write!(f, "MINIMAL"),
            Self::Low => write!(f, "LOW"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Severity class of a traffic incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum IncidentSeverity {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
        }
    }
}

/// A geographic area polled as one unit, covering a set of postal codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct District {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Postal codes (or forward sortation areas) inside the district.
    #[serde(default)]
    pub postal_codes: Vec<String>,
}

impl District {
    pub fn new(name: impl Into<String>, lat: f64, lon: f64, postal_codes: &[&str]) -> Self {
        Self {
            name: name.into(),
            lat,
            lon,
            postal_codes: postal_codes.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Great-circle distance in kilometres from this district's centre.
    pub fn distance_km(&self, lat: f64, lon: f64) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let (p1, p2) = (self.lat.to_radians(), lat.to_radians());
        let dp = (lat - self.lat).to_radians();
        let dl = (lon - self.lon).to_radians();
        let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Every postal code covered by `districts`, deduplicated, in district order.
pub fn postal_codes(districts: &[District]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    districts
        .iter()
        .flat_map(|d| d.postal_codes.iter())
        .filter(|pc| seen.insert(pc.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_thresholds() {
        assert_eq!(RiskLevel::from_composite(0.0), RiskLevel::Minimal);
        assert_eq!(RiskLevel::from_composite(0.1), RiskLevel::Low);
        assert_eq!(RiskLevel::from_composite(0.29), RiskLevel::Low);
        assert_eq!(RiskLevel::from_composite(0.3), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_composite(0.5), RiskLevel::High);
        assert_eq!(RiskLevel::from_composite(0.7), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_composite(1.0), RiskLevel::Critical);
    }

    #[test]
    fn risk_level_serialises_uppercase() {
        let json = serde_json::to_string(&RiskLevel::Moderate).unwrap();
        assert_eq!(json, "\"MODERATE\"");
        assert_eq!(RiskLevel::Critical.to_string(), "CRITICAL");
    }

    #[test]
    fn every_level_has_recommendations() {
        for level in [
            RiskLevel::Minimal,
            RiskLevel::Low,
            RiskLevel::Moderate,
            RiskLevel::High,
            RiskLevel::Critical,
        ] {
            assert!(!level.recommendations().is_empty());
        }
    }

    #[test]
    fn distance_is_zero_at_centre_and_grows() {
        let d = District::new("Downtown", 45.5017, -73.5673, &["H3A"]);
        assert!(d.distance_km(45.5017, -73.5673) < 1e-9);
        // Westmount centre is roughly 4 km away.
        let km = d.distance_km(45.4833, -73.6000);
        assert!(km > 2.0 && km < 5.0, "got {km}");
    }
}
