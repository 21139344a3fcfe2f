// =============================================================================
// Runtime Configuration — pipeline settings with atomic save
// =============================================================================
//
// Central configuration hub for the RiskPulse pipeline: weights, cycle timing,
// districts, source endpoints and the normalisation table.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
//
// Environment variables override the file (see `apply_overrides`). Weights
// are validated after overrides and an invalid set aborts startup.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AggregationError;
use crate::risk::{NormalizationTable, RiskWeights};
use crate::types::{postal_codes, District, IncidentSeverity, SignalSource};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_cycle_interval_secs() -> u64 {
    900
}

fn default_cycle_deadline_secs() -> u64 {
    150
}

fn default_weather_timeout_secs() -> u64 {
    30
}

fn default_stock_timeout_secs() -> u64 {
    120
}

fn default_traffic_timeout_secs() -> u64 {
    30
}

fn default_districts() -> Vec<District> {
    vec![
        District::new("Downtown", 45.5017, -73.5673, &["H3A", "H3B", "H2Y", "H2Z"]),
        District::new("Plateau", 45.5200, -73.5800, &["H2T", "H2W", "H2X"]),
        District::new("Westmount", 45.4833, -73.6000, &["H3Y", "H3Z"]),
        District::new("NDG", 45.4700, -73.6100, &["H4A", "H3S"]),
        District::new("Verdun", 45.4583, -73.5667, &["H3E", "H4G"]),
        District::new("LaSalle", 45.4333, -73.6333, &["H8N", "H8P"]),
        District::new("Outremont", 45.5167, -73.6000, &["H2V", "H3V"]),
        District::new("Rosemont", 45.5500, -73.5667, &["H1X", "H2S"]),
    ]
}

fn default_stock_symbols() -> Vec<String> {
    ["IFC.TO", "FFH.TO", "MFC.TO", "SLF.TO", "POW.TO", "GWO.TO", "IAG.TO", "HCG.TO"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_stock_request_spacing_ms() -> u64 {
    12_000
}

fn default_stock_half_life_hours() -> f64 {
    72.0
}

fn default_weather_forecast() -> bool {
    true
}

fn default_weather_half_life_secs() -> f64 {
    3600.0
}

fn default_traffic_resource_id() -> String {
    "05deae93-d9fc-4acb-9779-e0942b5e962f".to_string()
}

fn default_traffic_record_limit() -> u32 {
    500
}

fn default_traffic_radius_km() -> f64 {
    5.0
}

fn default_traffic_fallback_confidence() -> f64 {
    0.25
}

fn default_export_dir() -> Option<PathBuf> {
    Some(PathBuf::from("data/exports"))
}

fn default_weight_weather() -> f64 {
    0.4
}

fn default_weight_stock() -> f64 {
    0.3
}

fn default_weight_traffic() -> f64 {
    0.3
}

// =============================================================================
// WeightsConfig
// =============================================================================

/// Unvalidated weights as read from file / environment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightsConfig {
    #[serde(default = "default_weight_weather")]
    pub weather: f64,
    #[serde(default = "default_weight_stock")]
    pub stock: f64,
    #[serde(default = "default_weight_traffic")]
    pub traffic: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            weather: default_weight_weather(),
            stock: default_weight_stock(),
            traffic: default_weight_traffic(),
        }
    }
}

// =============================================================================
// ApiKeys
// =============================================================================

/// Source credentials, read from the environment only and never persisted.
#[derive(Clone, Default)]
pub struct ApiKeys {
    pub openweather: Option<String>,
    pub alphavantage: Option<String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            openweather: non_empty("OPENWEATHER_API_KEY"),
            alphavantage: non_empty("ALPHAVANTAGE_API_KEY"),
        }
    }
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |k: &Option<String>| if k.is_some() { "<redacted>" } else { "<unset>" };
        f.debug_struct("ApiKeys")
            .field("openweather", &redact(&self.openweather))
            .field("alphavantage", &redact(&self.alphavantage))
            .finish()
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the RiskPulse pipeline.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Scoring -------------------------------------------------------------

    /// Per-source weights; must sum to 1.0.
    #[serde(default)]
    pub weights: WeightsConfig,

    /// Per-source raw → severity rules.
    #[serde(default)]
    pub normalization: NormalizationTable,

    // --- Cycle timing ---------------------------------------------------------

    /// Seconds between cycle starts.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Hard bound on collection time within a cycle. Sources still running
    /// at the deadline are treated as missing.
    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,

    #[serde(default = "default_weather_timeout_secs")]
    pub weather_timeout_secs: u64,

    #[serde(default = "default_stock_timeout_secs")]
    pub stock_timeout_secs: u64,

    #[serde(default = "default_traffic_timeout_secs")]
    pub traffic_timeout_secs: u64,

    // --- Geography ------------------------------------------------------------

    /// Districts polled for weather and matched against traffic incidents.
    #[serde(default = "default_districts")]
    pub districts: Vec<District>,

    // --- Stock source ---------------------------------------------------------

    /// Insurer basket whose mean daily change drives the stock signal.
    #[serde(default = "default_stock_symbols")]
    pub stock_symbols: Vec<String>,

    /// Pause between quote requests (free tier allows 5 per minute).
    #[serde(default = "default_stock_request_spacing_ms")]
    pub stock_request_spacing_ms: u64,

    #[serde(default = "default_stock_half_life_hours")]
    pub stock_staleness_half_life_hours: f64,

    // --- Weather source -------------------------------------------------------

    #[serde(default = "default_weather_half_life_secs")]
    pub weather_staleness_half_life_secs: f64,

    /// Also fetch and score the 3-hourly forecast for each district.
    #[serde(default = "default_weather_forecast")]
    pub weather_forecast: bool,

    // --- Traffic source -------------------------------------------------------

    /// Open-data resource holding road incidents.
    #[serde(default = "default_traffic_resource_id")]
    pub traffic_resource_id: String,

    #[serde(default = "default_traffic_record_limit")]
    pub traffic_record_limit: u32,

    /// Located incidents further than this from every district are ignored.
    #[serde(default = "default_traffic_radius_km")]
    pub traffic_match_radius_km: f64,

    /// Incidents below this severity are not counted.
    #[serde(default)]
    pub traffic_min_severity: IncidentSeverity,

    /// Use representative incidents when the feed is unreachable.
    #[serde(default)]
    pub traffic_fallback: bool,

    #[serde(default = "default_traffic_fallback_confidence")]
    pub traffic_fallback_confidence: f64,

    // --- Output ---------------------------------------------------------------

    /// Directory for cycle exports; `null` disables exporting.
    #[serde(default = "default_export_dir")]
    pub export_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            weights: WeightsConfig::default(),
            normalization: NormalizationTable::default(),
            cycle_interval_secs: default_cycle_interval_secs(),
            cycle_deadline_secs: default_cycle_deadline_secs(),
            weather_timeout_secs: default_weather_timeout_secs(),
            stock_timeout_secs: default_stock_timeout_secs(),
            traffic_timeout_secs: default_traffic_timeout_secs(),
            districts: default_districts(),
            stock_symbols: default_stock_symbols(),
            stock_request_spacing_ms: default_stock_request_spacing_ms(),
            stock_staleness_half_life_hours: default_stock_half_life_hours(),
            weather_staleness_half_life_secs: default_weather_half_life_secs(),
            weather_forecast: default_weather_forecast(),
            traffic_resource_id: default_traffic_resource_id(),
            traffic_record_limit: default_traffic_record_limit(),
            traffic_match_radius_km: default_traffic_radius_km(),
            traffic_min_severity: IncidentSeverity::default(),
            traffic_fallback: false,
            traffic_fallback_confidence: default_traffic_fallback_confidence(),
            export_dir: default_export_dir(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            districts = config.districts.len(),
            cycle_interval_secs = config.cycle_interval_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `RISKPULSE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|k| std::env::var(k).ok())
    }

    /// Apply overrides from any key → value lookup. Unparsable values are
    /// errors rather than silently ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let parse_f64 = |key: &str| -> Result<Option<f64>> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<f64>()
                    .map(Some)
                    .with_context(|| format!("{key}={v} is not a number")),
                None => Ok(None),
            }
        };

        if let Some(w) = parse_f64("RISKPULSE_WEIGHT_WEATHER")? {
            self.weights.weather = w;
        }
        if let Some(w) = parse_f64("RISKPULSE_WEIGHT_STOCK")? {
            self.weights.stock = w;
        }
        if let Some(w) = parse_f64("RISKPULSE_WEIGHT_TRAFFIC")? {
            self.weights.traffic = w;
        }
        if let Some(v) = lookup("RISKPULSE_CYCLE_SECS") {
            self.cycle_interval_secs = v
                .trim()
                .parse()
                .with_context(|| format!("RISKPULSE_CYCLE_SECS={v} is not a whole number"))?;
        }
        if let Some(v) = lookup("RISKPULSE_EXPORT_DIR") {
            let v = v.trim();
            self.export_dir = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        Ok(())
    }

    /// The configured weights, validated.
    pub fn risk_weights(&self) -> Result<RiskWeights, AggregationError> {
        RiskWeights::new(self.weights.weather, self.weights.stock, self.weights.traffic)
    }

    /// Check every invariant the pipeline relies on and return the validated
    /// weights.
    pub fn validate(&self) -> Result<RiskWeights> {
        let weights = self.risk_weights()?;
        self.normalization.validate()?;

        if self.districts.is_empty() {
            anyhow::bail!("at least one district must be configured");
        }
        if self.cycle_interval_secs == 0 || self.cycle_deadline_secs == 0 {
            anyhow::bail!("cycle interval and deadline must be positive");
        }
        if !(0.0..=1.0).contains(&self.traffic_fallback_confidence) {
            anyhow::bail!(
                "traffic_fallback_confidence {} outside [0, 1]",
                self.traffic_fallback_confidence
            );
        }
        Ok(weights)
    }

    /// Every configured postal code, deduplicated, in district order.
    pub fn postal_codes(&self) -> Vec<String> {
        postal_codes(&self.districts)
    }

    /// Time budget for one source: its own timeout capped by the deadline.
    pub fn source_timeout(&self, source: SignalSource) -> Duration {
        let own = match source {
            SignalSource::Weather => self.weather_timeout_secs,
            SignalSource::Stock => self.stock_timeout_secs,
            SignalSource::Traffic => self.traffic_timeout_secs,
        };
        Duration::from_secs(own.min(self.cycle_deadline_secs))
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.cycle_interval_secs, 900);
        assert_eq!(cfg.districts.len(), 8);
        assert_eq!(cfg.districts[0].name, "Downtown");
        assert_eq!(cfg.stock_symbols.len(), 8);
        assert_eq!(cfg.stock_symbols[0], "IFC.TO");
        assert!(!cfg.traffic_fallback);
        assert!(cfg.weather_forecast);
        assert!((cfg.weights.weather - 0.4).abs() < f64::EPSILON);
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.cycle_deadline_secs, 150);
        assert_eq!(cfg.districts.len(), 8);
        assert_eq!(cfg.traffic_min_severity, IncidentSeverity::Low);
        assert_eq!(cfg.export_dir, Some(PathBuf::from("data/exports")));
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "weights": { "weather": 0.5, "stock": 0.5, "traffic": 0.0 },
                        "stock_symbols": ["IFC.TO"], "export_dir": null }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.stock_symbols, vec!["IFC.TO"]);
        assert_eq!(cfg.export_dir, None);
        assert_eq!(cfg.cycle_interval_secs, 900);
        let w = cfg.validate().unwrap();
        assert!((w.weight(SignalSource::Traffic)).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_weights_fail_validation() {
        let json = r#"{ "weights": { "weather": 0.5, "stock": 0.5, "traffic": 0.5 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        let err = cfg.risk_weights().unwrap_err();
        assert!(matches!(err, AggregationError::InvalidWeights(_)));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_replace_weights() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(lookup(&[
            ("RISKPULSE_WEIGHT_WEATHER", "0.6"),
            ("RISKPULSE_WEIGHT_STOCK", " 0.2 "),
            ("RISKPULSE_WEIGHT_TRAFFIC", "0.2"),
            ("RISKPULSE_CYCLE_SECS", "60"),
            ("RISKPULSE_EXPORT_DIR", ""),
        ]))
        .unwrap();
        assert!((cfg.weights.weather - 0.6).abs() < f64::EPSILON);
        assert!((cfg.weights.stock - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.cycle_interval_secs, 60);
        assert_eq!(cfg.export_dir, None);
        cfg.validate().unwrap();
    }

    #[test]
    fn env_override_that_breaks_the_sum_is_caught() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(lookup(&[("RISKPULSE_WEIGHT_WEATHER", "0.9")]))
            .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unparsable_override_is_an_error() {
        let mut cfg = RuntimeConfig::default();
        assert!(cfg
            .apply_overrides(lookup(&[("RISKPULSE_WEIGHT_STOCK", "thirty")]))
            .is_err());
    }

    #[test]
    fn postal_codes_are_deduplicated_in_order() {
        let mut cfg = RuntimeConfig::default();
        cfg.districts = vec![
            District::new("A", 0.0, 0.0, &["H1A", "H1B"]),
            District::new("B", 0.0, 0.0, &["H1B", "H1C"]),
        ];
        assert_eq!(cfg.postal_codes(), vec!["H1A", "H1B", "H1C"]);
    }

    #[test]
    fn source_timeout_is_capped_by_deadline() {
        let mut cfg = RuntimeConfig::default();
        cfg.cycle_deadline_secs = 20;
        assert_eq!(cfg.source_timeout(SignalSource::Stock), Duration::from_secs(20));
        cfg.cycle_deadline_secs = 200;
        assert_eq!(cfg.source_timeout(SignalSource::Stock), Duration::from_secs(120));
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riskpulse_config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.traffic_fallback = true;
        cfg.save(&path).unwrap();
        let back = RuntimeConfig::load(&path).unwrap();
        assert!(back.traffic_fallback);
        assert_eq!(back.districts, cfg.districts);
        assert_eq!(back.normalization, cfg.normalization);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RuntimeConfig::load(dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn api_keys_debug_is_redacted() {
        let keys = ApiKeys::from_lookup(lookup(&[("OPENWEATHER_API_KEY", "secret123")]));
        let dbg = format!("{keys:?}");
        assert!(!dbg.contains("secret123"));
        assert!(dbg.contains("<redacted>"));
        assert!(dbg.contains("<unset>"));
    }

    #[test]
    fn blank_api_key_counts_as_unset() {
        let keys = ApiKeys::from_lookup(lookup(&[("ALPHAVANTAGE_API_KEY", "  ")]));
        assert!(keys.alphavantage.is_none());
    }
}
