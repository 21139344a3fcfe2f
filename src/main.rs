// =============================================================================
// RiskPulse — Main Entry Point
// =============================================================================
//
// Usage:
//   riskpulse          scheduled cycles until Ctrl+C
//   riskpulse once     a single cycle, then exit
//   riskpulse check    query each source once and report reachability
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod collectors;
mod error;
mod export;
mod pipeline;
mod risk;
mod runtime_config;
mod signals;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::collectors::Collectors;
use crate::runtime_config::{ApiKeys, RuntimeConfig};
use crate::types::SignalSource;

const DEFAULT_CONFIG_PATH: &str = "riskpulse_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Scheduled,
    Once,
    Check,
}

impl Mode {
    fn from_arg(arg: Option<&str>) -> anyhow::Result<Self> {
        match arg {
            None | Some("run") => Ok(Self::Scheduled),
            Some("once") => Ok(Self::Once),
            Some("check") => Ok(Self::Check),
            Some(other) => anyhow::bail!("unknown mode '{other}' (expected run, once or check)"),
        }
    }
}

/// Load the config at `path`, or write defaults there if it does not exist.
fn load_or_init_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    if path.exists() {
        return RuntimeConfig::load(path);
    }
    warn!(path = %path.display(), "config file not found, using defaults");
    let config = RuntimeConfig::default();
    if let Err(e) = config.save(path) {
        warn!(error = %e, "could not write default config");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = Mode::from_arg(std::env::args().nth(1).as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), mode = ?mode, "RiskPulse starting");

    // ── 2. Configuration (fail fast on invalid weights) ──────────────────
    let config_path = PathBuf::from(
        std::env::var("RISKPULSE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let mut config = load_or_init_config(&config_path)?;
    config
        .apply_env_overrides()
        .context("invalid RISKPULSE_* environment override")?;
    let weights = config.validate().context("configuration rejected")?;

    let keys = ApiKeys::from_env();
    info!(
        weather = weights.weight(SignalSource::Weather),
        stock = weights.weight(SignalSource::Stock),
        traffic = weights.weight(SignalSource::Traffic),
        districts = config.districts.len(),
        postal_codes = config.postal_codes().len(),
        api_keys = ?keys,
        "configuration validated"
    );

    // ── 3. Clients & shared state ────────────────────────────────────────
    let collectors = Arc::new(Collectors::from_config(&config, &keys)?);
    let interval = config.cycle_interval();
    let state = Arc::new(AppState::new(config)?);

    match mode {
        Mode::Check => {
            let outcome = collectors.collect(&state.config.districts).await;
            for source in SignalSource::ALL {
                let count = outcome
                    .observations
                    .iter()
                    .filter(|o| o.source == source)
                    .count();
                match outcome.failures.iter().find(|f| f.source == source) {
                    Some(f) => error!(source = %source, reason = %f.reason, "source unreachable"),
                    None => info!(source = %source, observations = count, "source reachable"),
                }
            }
            return Ok(());
        }
        Mode::Once => {
            pipeline::run_cycle(&state, &collectors).await;
            for postal_code in state.config.postal_codes() {
                match state.latest(&postal_code) {
                    Some(score) => info!(
                        postal_code = %postal_code,
                        composite = score.composite,
                        risk_level = %score.risk_level,
                        sources = ?score.contributing_sources,
                        recommendations = ?score.risk_level.recommendations(),
                        "score"
                    ),
                    None => warn!(postal_code = %postal_code, "no score"),
                }
            }
            return Ok(());
        }
        Mode::Scheduled => {}
    }

    // ── 4. Scheduler loop ────────────────────────────────────────────────
    let cycle_state = state.clone();
    let cycle_collectors = collectors.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            pipeline::run_cycle(&cycle_state, &cycle_collectors).await;
        }
    });

    info!(interval_secs = interval.as_secs(), "Scheduler running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");

    info!(
        cycles = state.cycle_count(),
        postal_codes_scored = state.latest_scores().len(),
        uptime_secs = state.uptime_secs(),
        "RiskPulse shut down complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_modes() {
        assert_eq!(Mode::from_arg(None).unwrap(), Mode::Scheduled);
        assert_eq!(Mode::from_arg(Some("run")).unwrap(), Mode::Scheduled);
        assert_eq!(Mode::from_arg(Some("once")).unwrap(), Mode::Once);
        assert_eq!(Mode::from_arg(Some("check")).unwrap(), Mode::Check);
        assert!(Mode::from_arg(Some("daemon")).is_err());
    }

    #[test]
    fn missing_config_is_initialised_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riskpulse_config.json");
        let cfg = load_or_init_config(&path).unwrap();
        assert_eq!(cfg.cycle_interval_secs, 900);
        assert!(path.exists());
        assert_eq!(load_or_init_config(&path).unwrap().districts, cfg.districts);
    }
}
