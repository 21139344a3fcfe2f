// =============================================================================
// Collectors Module
// =============================================================================
//
// One client per external feed, run concurrently each cycle:
// - Weather: OpenWeatherMap current conditions per district
// - Stock: Alpha Vantage quotes for the insurer basket
// - Traffic: Montréal open-data road incidents
//
// Each fetch is bounded by its own timeout (capped by the cycle deadline). A
// failed or late source becomes a `SourceFailure` and never holds up the
// other two.

pub mod stock;
pub mod traffic;
pub mod weather;

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::runtime_config::{ApiKeys, RuntimeConfig};
use crate::signals::{ConfidenceDecay, RawObservation};
use crate::types::{postal_codes, District, SignalSource};

pub use stock::StockClient;
pub use traffic::{TrafficClient, TrafficSettings};
pub use weather::{DistrictWeather, WeatherClient};

const USER_AGENT: &str = concat!("riskpulse/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A source that produced nothing this cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: SignalSource,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct CollectionOutcome {
    pub observations: Vec<RawObservation>,
    pub failures: Vec<SourceFailure>,
    /// Current and forecast weather per district, when weather answered.
    pub weather: Vec<DistrictWeather>,
}

impl CollectionOutcome {
    fn absorb(&mut self, source: SignalSource, result: Result<Vec<RawObservation>, SourceFailure>) {
        match result {
            Ok(obs) => {
                info!(source = %source, observations = obs.len(), "source collected");
                self.observations.extend(obs);
            }
            Err(failure) => {
                warn!(source = %source, reason = %failure.reason, "source failed");
                self.failures.push(failure);
            }
        }
    }
}

/// Run `fut` with a time limit, mapping errors and timeouts to a failure.
async fn bounded<T, F>(source: SignalSource, limit: Duration, fut: F) -> Result<T, SourceFailure>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SourceFailure {
            source,
            reason: format!("{e:#}"),
        }),
        Err(_) => Err(SourceFailure {
            source,
            reason: format!("timed out after {}s", limit.as_secs_f64()),
        }),
    }
}

/// The three source clients plus their time budgets.
#[derive(Debug, Clone)]
pub struct Collectors {
    weather: WeatherClient,
    stock: StockClient,
    traffic: TrafficClient,
    stock_symbols: Vec<String>,
    weather_timeout: Duration,
    stock_timeout: Duration,
    traffic_timeout: Duration,
}

impl Collectors {
    /// Build all clients over one shared HTTP connection pool.
    pub fn from_config(config: &RuntimeConfig, keys: &ApiKeys) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let weather = WeatherClient::with_client(
            client.clone(),
            keys.openweather.clone(),
            ConfidenceDecay::new(config.weather_staleness_half_life_secs),
            config.weather_forecast,
        );
        let stock = StockClient::with_client(
            client.clone(),
            keys.alphavantage.clone(),
            Duration::from_millis(config.stock_request_spacing_ms),
            ConfidenceDecay::new(config.stock_staleness_half_life_hours * 3600.0),
        );
        let traffic = TrafficClient::with_client(
            client,
            TrafficSettings {
                resource_id: config.traffic_resource_id.clone(),
                record_limit: config.traffic_record_limit,
                match_radius_km: config.traffic_match_radius_km,
                min_severity: config.traffic_min_severity,
                fallback: config.traffic_fallback,
                fallback_confidence: config.traffic_fallback_confidence,
            },
        );

        Ok(Self {
            weather,
            stock,
            traffic,
            stock_symbols: config.stock_symbols.clone(),
            weather_timeout: config.source_timeout(SignalSource::Weather),
            stock_timeout: config.source_timeout(SignalSource::Stock),
            traffic_timeout: config.source_timeout(SignalSource::Traffic),
        })
    }

    /// Fetch every source concurrently for `districts`.
    pub async fn collect(&self, districts: &[District]) -> CollectionOutcome {
        let codes = postal_codes(districts);

        let (weather, stock, traffic) = tokio::join!(
            bounded(
                SignalSource::Weather,
                self.weather_timeout,
                self.weather.fetch(districts)
            ),
            bounded(
                SignalSource::Stock,
                self.stock_timeout,
                self.stock.fetch(&self.stock_symbols, &codes)
            ),
            bounded(
                SignalSource::Traffic,
                self.traffic_timeout,
                self.traffic.fetch(districts)
            ),
        );

        let mut outcome = CollectionOutcome::default();
        let weather = weather.map(|batch| {
            outcome.weather = batch.summaries;
            batch.observations
        });
        outcome.absorb(SignalSource::Weather, weather);
        outcome.absorb(SignalSource::Stock, stock);
        outcome.absorb(SignalSource::Traffic, traffic);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn obs(source: SignalSource) -> RawObservation {
        RawObservation {
            source,
            postal_code: "H3A".into(),
            timestamp: Utc::now(),
            raw_value: 1.0,
            confidence: 1.0,
        }
    }

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let res = bounded(SignalSource::Weather, Duration::from_secs(1), async {
            Ok::<_, anyhow::Error>(vec![obs(SignalSource::Weather)])
        })
        .await;
        assert_eq!(res.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bounded_turns_a_timeout_into_a_failure() {
        let res = bounded(SignalSource::Stock, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(vec![obs(SignalSource::Stock)])
        })
        .await;
        let failure = res.unwrap_err();
        assert_eq!(failure.source, SignalSource::Stock);
        assert!(failure.reason.contains("timed out"));
    }

    #[tokio::test]
    async fn bounded_keeps_the_error_chain() {
        let res = bounded(SignalSource::Traffic, Duration::from_secs(1), async {
            Err::<Vec<RawObservation>, _>(anyhow::anyhow!("connection refused"))
                .context("GET datastore_search")
        })
        .await;
        let reason = res.unwrap_err().reason;
        assert!(reason.contains("GET datastore_search"));
        assert!(reason.contains("connection refused"));
    }
}
