// =============================================================================
// Weather Collector — OpenWeatherMap current conditions per district
// =============================================================================
//
// Each district's current observation is folded into a 0–10 risk index:
//
//   temperature   < -30 / -20 / -10 / 0 °C  =>  +4 / +3 / +2 / +1
//                 > 40 / 35 / 30 / 25 °C    =>  +4 / +3 / +2 / +1
//   condition     table below (unknown conditions => +1)
//   wind          > 25 / 15 / 10 m/s        =>  +3 / +2 / +1
//   visibility    < 500 / 1000 / 5000 m     =>  +3 / +2 / +1
//   humidity      > 90 % or < 20 %          =>  +1
//   pressure      < 980 / 1000 hPa, > 1030  =>  +2 / +1 / +1
//
// capped at 10. The index is fanned out to every postal code of the district;
// confidence decays with the age of the observation.
//
// When enabled, the 3-hourly forecast is scored with the same index and its
// average / maximum are reported per district beside the current risk. The
// forecast does not feed the composite score.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::signals::{ConfidenceDecay, RawObservation};
use crate::types::{District, SignalSource};

const BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

/// 3-hourly forecast points considered: the next ~2.5 days.
const FORECAST_POINTS: usize = 20;

const CONDITION_RISK: &[(&str, f64)] = &[
    ("thunderstorm", 4.5),
    ("drizzle", 1.5),
    ("rain", 2.5),
    ("snow", 3.5),
    ("mist", 1.5),
    ("smoke", 2.0),
    ("haze", 1.5),
    ("dust", 2.5),
    ("fog", 3.0),
    ("sand", 2.5),
    ("ash", 4.0),
    ("squall", 4.0),
    ("tornado", 5.0),
    ("clear", 0.0),
    ("clouds", 0.5),
];

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentWeatherResponse {
    pub main: MainBlock,
    #[serde(default)]
    pub weather: Vec<ConditionBlock>,
    #[serde(default)]
    pub wind: WindBlock,
    #[serde(default = "default_visibility")]
    pub visibility: f64,
    /// Observation time, UNIX seconds.
    pub dt: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainBlock {
    pub temp: f64,
    pub humidity: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionBlock {
    pub main: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WindBlock {
    #[serde(default)]
    pub speed: f64,
}

fn default_visibility() -> f64 {
    10_000.0
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Current conditions at one district centre.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherObservation {
    pub observed_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
    /// Lower-cased condition group, e.g. "snow".
    pub condition: String,
    pub wind_speed_ms: f64,
    pub visibility_m: f64,
}

impl WeatherObservation {
    pub fn from_response(resp: &CurrentWeatherResponse) -> Result<Self> {
        let observed_at = DateTime::<Utc>::from_timestamp(resp.dt, 0)
            .with_context(|| format!("observation time {} out of range", resp.dt))?;
        let condition = resp
            .weather
            .first()
            .map(|c| c.main.to_lowercase())
            .unwrap_or_default();

        Ok(Self {
            observed_at,
            temperature_c: resp.main.temp,
            humidity_pct: resp.main.humidity,
            pressure_hpa: resp.main.pressure,
            condition,
            wind_speed_ms: resp.wind.speed,
            visibility_m: resp.visibility,
        })
    }

    /// Risk index in [0, 10].
    pub fn risk_index(&self) -> f64 {
        let mut score = 0.0;

        let t = self.temperature_c;
        score += if t < -30.0 {
            4.0
        } else if t < -20.0 {
            3.0
        } else if t < -10.0 {
            2.0
        } else if t < 0.0 {
            1.0
        } else if t > 40.0 {
            4.0
        } else if t > 35.0 {
            3.0
        } else if t > 30.0 {
            2.0
        } else if t > 25.0 {
            1.0
        } else {
            0.0
        };

        score += CONDITION_RISK
            .iter()
            .find(|(name, _)| *name == self.condition)
            .map(|(_, risk)| *risk)
            .unwrap_or(1.0);

        let wind = self.wind_speed_ms;
        score += if wind > 25.0 {
            3.0
        } else if wind > 15.0 {
            2.0
        } else if wind > 10.0 {
            1.0
        } else {
            0.0
        };

        let vis = self.visibility_m;
        score += if vis < 500.0 {
            3.0
        } else if vis < 1000.0 {
            2.0
        } else if vis < 5000.0 {
            1.0
        } else {
            0.0
        };

        if self.humidity_pct > 90.0 || self.humidity_pct < 20.0 {
            score += 1.0;
        }

        let p = self.pressure_hpa;
        score += if p < 980.0 {
            2.0
        } else if p < 1000.0 {
            1.0
        } else if p > 1030.0 {
            1.0
        } else {
            0.0
        };

        f64::min(score, 10.0)
    }

    /// Named hazards present in this observation.
    pub fn risk_factors(&self) -> Vec<&'static str> {
        let mut factors = Vec::new();
        let c = self.condition.as_str();

        if self.temperature_c < -15.0 {
            factors.push("Extreme Cold");
        }
        if self.temperature_c > 32.0 {
            factors.push("Extreme Heat");
        }
        if c == "thunderstorm" || c == "tornado" {
            factors.push("Severe Weather");
        }
        if c == "rain" || c == "drizzle" {
            factors.push("Wet Roads");
        }
        if c == "snow" {
            factors.push("Snow/Ice Conditions");
        }
        if self.wind_speed_ms > 15.0 {
            factors.push("High Winds");
        }
        if self.visibility_m < 5000.0 {
            factors.push("Poor Visibility");
        }
        if self.humidity_pct > 85.0 {
            factors.push("High Humidity");
        }
        factors
    }
}

/// Fan one district observation out to the district's postal codes.
pub fn district_observations(
    district: &District,
    obs: &WeatherObservation,
    decay: &ConfidenceDecay,
    now: DateTime<Utc>,
) -> Vec<RawObservation> {
    let raw_value = obs.risk_index();
    let confidence = decay.apply(1.0, obs.observed_at, now);
    district
        .postal_codes
        .iter()
        .map(|pc| RawObservation {
            source: SignalSource::Weather,
            postal_code: pc.clone(),
            timestamp: obs.observed_at,
            raw_value,
            confidence,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Forecast
// ---------------------------------------------------------------------------

/// Forecast entries share the current-conditions shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastResponse {
    #[serde(default)]
    pub list: Vec<CurrentWeatherResponse>,
}

/// Risk index over the upcoming forecast window of one district.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRisk {
    pub points: usize,
    pub avg_risk: f64,
    pub max_risk: f64,
    /// Forecast time of the riskiest point.
    pub worst_at: DateTime<Utc>,
}

/// Score the first `FORECAST_POINTS` forecast points with the same index as
/// current conditions.
pub fn forecast_risk(points: &[WeatherObservation]) -> Option<ForecastRisk> {
    let window = &points[..points.len().min(FORECAST_POINTS)];
    let worst = window
        .iter()
        .max_by(|a, b| a.risk_index().total_cmp(&b.risk_index()))?;
    let total: f64 = window.iter().map(|p| p.risk_index()).sum();
    Some(ForecastRisk {
        points: window.len(),
        avg_risk: total / window.len() as f64,
        max_risk: worst.risk_index(),
        worst_at: worst.observed_at,
    })
}

/// Per-district weather picture reported with each cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistrictWeather {
    pub district: String,
    pub observed_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub condition: String,
    pub current_risk: f64,
    pub risk_factors: Vec<&'static str>,
    pub forecast: Option<ForecastRisk>,
}

impl DistrictWeather {
    pub fn new(district: &District, current: &WeatherObservation, forecast: Option<ForecastRisk>) -> Self {
        Self {
            district: district.name.clone(),
            observed_at: current.observed_at,
            temperature_c: current.temperature_c,
            condition: current.condition.clone(),
            current_risk: current.risk_index(),
            risk_factors: current.risk_factors(),
            forecast,
        }
    }
}

/// What one weather fetch produced: scoring inputs plus district summaries.
#[derive(Debug, Default)]
pub struct WeatherBatch {
    pub observations: Vec<RawObservation>,
    pub summaries: Vec<DistrictWeather>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Fetches current conditions, and optionally the forecast, for each district.
#[derive(Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    api_key: Option<String>,
    decay: ConfidenceDecay,
    forecast: bool,
}

impl WeatherClient {
    pub fn with_client(
        client: reqwest::Client,
        api_key: Option<String>,
        decay: ConfidenceDecay,
        forecast: bool,
    ) -> Self {
        Self {
            client,
            api_key,
            decay,
            forecast,
        }
    }

    /// GET `endpoint` for a district centre. The key travels as a query
    /// parameter and the URL is stripped from transport errors.
    async fn get_json(&self, endpoint: &str, district: &District) -> Result<serde_json::Value> {
        let key = self
            .api_key
            .as_deref()
            .context("OPENWEATHER_API_KEY is not set")?;
        let (lat, lon) = (district.lat.to_string(), district.lon.to_string());

        let resp = self
            .client
            .get(format!("{BASE_URL}/{endpoint}"))
            .query(&[
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("appid", key),
                ("units", "metric"),
            ])
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("GET {endpoint} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to parse {endpoint} response body"))?;

        if !status.is_success() {
            anyhow::bail!("OpenWeatherMap {} returned {}: {}", endpoint, status, body);
        }
        Ok(body)
    }

    #[instrument(skip(self, district), fields(district = %district.name), name = "weather::fetch_current")]
    async fn fetch_current(&self, district: &District) -> Result<WeatherObservation> {
        let body = self.get_json("weather", district).await?;
        let parsed: CurrentWeatherResponse =
            serde_json::from_value(body).context("unexpected current weather payload")?;
        WeatherObservation::from_response(&parsed)
    }

    #[instrument(skip(self, district), fields(district = %district.name), name = "weather::fetch_forecast")]
    async fn fetch_forecast(&self, district: &District) -> Result<Vec<WeatherObservation>> {
        let body = self.get_json("forecast", district).await?;
        let parsed: ForecastResponse =
            serde_json::from_value(body).context("unexpected forecast payload")?;
        parsed
            .list
            .iter()
            .take(FORECAST_POINTS)
            .map(WeatherObservation::from_response)
            .collect()
    }

    /// Current conditions are required; a failed forecast only drops the
    /// forecast summary.
    async fn fetch_district(
        &self,
        district: &District,
    ) -> Result<(WeatherObservation, Option<ForecastRisk>)> {
        let current = self.fetch_current(district).await?;
        if !self.forecast {
            return Ok((current, None));
        }
        let forecast = match self.fetch_forecast(district).await {
            Ok(points) => forecast_risk(&points),
            Err(e) => {
                warn!(district = %district.name, error = %format!("{e:#}"), "forecast fetch failed");
                None
            }
        };
        Ok((current, forecast))
    }

    /// Fetch every district concurrently. Individual district failures are
    /// logged and skipped; the source fails only if no district answered.
    pub async fn fetch(&self, districts: &[District]) -> Result<WeatherBatch> {
        let results = join_all(districts.iter().map(|d| self.fetch_district(d))).await;
        let now = Utc::now();

        let mut batch = WeatherBatch::default();
        let mut last_error = None;
        for (district, result) in districts.iter().zip(results) {
            match result {
                Ok((obs, forecast)) => {
                    let summary = DistrictWeather::new(district, &obs, forecast);
                    debug!(
                        district = %district.name,
                        risk_index = summary.current_risk,
                        condition = %summary.condition,
                        factors = ?summary.risk_factors,
                        forecast_avg = summary.forecast.as_ref().map(|f| f.avg_risk),
                        forecast_max = summary.forecast.as_ref().map(|f| f.max_risk),
                        "weather observed"
                    );
                    batch
                        .observations
                        .extend(district_observations(district, &obs, &self.decay, now));
                    batch.summaries.push(summary);
                }
                Err(e) => {
                    warn!(district = %district.name, error = %format!("{e:#}"), "weather fetch failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if batch.observations.is_empty() => Err(e.context("no district returned weather")),
            _ => Ok(batch),
        }
    }
}

impl std::fmt::Debug for WeatherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherClient")
            .field("api_key", &"<redacted>")
            .field("decay", &self.decay)
            .field("forecast", &self.forecast)
            .finish()
    }
}
