// =============================================================================
// Traffic Collector — Montréal open-data road incidents
// =============================================================================
//
// Pulls the incident table from the city's CKAN datastore and turns it into an
// incident count per district:
//   - located incidents go to the nearest district centre within the match
//     radius, or are ignored when none is close enough
//   - unlocated incidents apply to every district
//   - incidents below the configured minimum severity are not counted
//
// When the feed is down and the fallback switch is on, a fixed set of
// representative incidents stands in with a reduced confidence.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::signals::RawObservation;
use crate::types::{District, IncidentSeverity, SignalSource};

const BASE_URL: &str = "https://donnees.montreal.ca/api/3/action/datastore_search";

const TYPE_FIELDS: &[&str] = &["type_incident", "type", "description_type"];
const LOCATION_FIELDS: &[&str] = &["location", "locatation", "localisation", "rue"];
const LAT_FIELDS: &[&str] = &["latitude", "lat"];
const LON_FIELDS: &[&str] = &["longitude", "lon", "long"];

#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub incident_type: String,
    pub location: String,
    pub severity: IncidentSeverity,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Incident {
    fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Classify an incident by keywords in its type (English or French).
pub fn categorize_incident(incident_type: &str) -> IncidentSeverity {
    fn contains_any(text: &str, words: &[&str]) -> bool {
        words.iter().any(|w| text.contains(w))
    }

    let lower = incident_type.to_lowercase();
    if contains_any(&lower, &["accident", "collision", "crash"]) {
        IncidentSeverity::High
    } else if contains_any(&lower, &["construction", "travaux", "maintenance"]) {
        IncidentSeverity::Medium
    } else if contains_any(&lower, &["traffic", "congestion", "embouteillage"]) {
        IncidentSeverity::Low
    } else {
        IncidentSeverity::Medium
    }
}

/// Case-insensitive lookup over several candidate column names.
fn field<'a>(
    record: &'a serde_json::Map<String, serde_json::Value>,
    names: &[&str],
) -> Option<&'a serde_json::Value> {
    record
        .iter()
        .find(|(k, _)| names.iter().any(|n| k.eq_ignore_ascii_case(n)))
        .map(|(_, v)| v)
}

fn as_text(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Coordinates arrive as numbers or as strings depending on the export.
fn as_coord(v: &serde_json::Value) -> Option<f64> {
    let parsed = match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    };
    parsed.filter(|c| c.is_finite())
}

/// Parse a `datastore_search` response into incidents.
pub fn parse_records(body: &serde_json::Value) -> Result<Vec<Incident>> {
    if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
        anyhow::bail!("datastore_search reported failure: {}", body);
    }
    let records = body
        .pointer("/result/records")
        .and_then(|v| v.as_array())
        .context("datastore_search response has no result.records")?;

    let incidents = records
        .iter()
        .filter_map(|r| r.as_object())
        .map(|r| {
            let incident_type = field(r, TYPE_FIELDS)
                .and_then(as_text)
                .unwrap_or_else(|| "Traffic Incident".to_string());
            let location = field(r, LOCATION_FIELDS)
                .and_then(as_text)
                .unwrap_or_else(|| "Unknown".to_string());
            Incident {
                severity: categorize_incident(&incident_type),
                incident_type,
                location,
                lat: field(r, LAT_FIELDS).and_then(as_coord),
                lon: field(r, LON_FIELDS).and_then(as_coord),
            }
        })
        .collect();
    Ok(incidents)
}

/// Representative incidents used when the live feed is unavailable.
pub fn fallback_incidents() -> Vec<Incident> {
    [
        ("Highway 40 - Decarie Interchange", "Vehicle Collision", IncidentSeverity::High, 45.4935, -73.6520),
        ("Rue Sainte-Catherine - Downtown", "Traffic Congestion", IncidentSeverity::Medium, 45.5030, -73.5710),
        ("Jacques-Cartier Bridge", "Maintenance Work", IncidentSeverity::Low, 45.5210, -73.5410),
        ("Highway 15 - Champlain Bridge approach", "Accident", IncidentSeverity::High, 45.4700, -73.5250),
        ("Boulevard Saint-Laurent", "Construction", IncidentSeverity::Medium, 45.5150, -73.5800),
    ]
    .into_iter()
    .map(|(location, kind, severity, lat, lon)| Incident {
        incident_type: kind.to_string(),
        location: location.to_string(),
        severity,
        lat: Some(lat),
        lon: Some(lon),
    })
    .collect()
}

/// Incident count per district, index-aligned with `districts`.
pub fn count_by_district(
    incidents: &[Incident],
    districts: &[District],
    radius_km: f64,
    min_severity: IncidentSeverity,
) -> Vec<usize> {
    let mut counts = vec![0usize; districts.len()];

    for incident in incidents.iter().filter(|i| i.severity >= min_severity) {
        match incident.coordinates() {
            None => counts.iter_mut().for_each(|c| *c += 1),
            Some((lat, lon)) => {
                let nearest = districts
                    .iter()
                    .enumerate()
                    .map(|(idx, d)| (idx, d.distance_km(lat, lon)))
                    .filter(|(_, km)| *km <= radius_km)
                    .min_by(|a, b| a.1.total_cmp(&b.1));
                if let Some((idx, _)) = nearest {
                    counts[idx] += 1;
                }
            }
        }
    }
    counts
}

/// One observation per postal code from the per-district counts.
pub fn district_observations(
    districts: &[District],
    counts: &[usize],
    confidence: f64,
    now: DateTime<Utc>,
) -> Vec<RawObservation> {
    districts
        .iter()
        .zip(counts)
        .flat_map(|(district, &count)| {
            district.postal_codes.iter().map(move |pc| RawObservation {
                source: SignalSource::Traffic,
                postal_code: pc.clone(),
                timestamp: now,
                raw_value: count as f64,
                confidence,
            })
        })
        .collect()
}

/// Settings for the traffic source, lifted from the runtime config.
#[derive(Debug, Clone)]
pub struct TrafficSettings {
    pub resource_id: String,
    pub record_limit: u32,
    pub match_radius_km: f64,
    pub min_severity: IncidentSeverity,
    pub fallback: bool,
    pub fallback_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct TrafficClient {
    client: reqwest::Client,
    settings: TrafficSettings,
}

impl TrafficClient {
    pub fn with_client(client: reqwest::Client, settings: TrafficSettings) -> Self {
        Self { client, settings }
    }

    #[instrument(skip(self), name = "traffic::fetch_incidents")]
    async fn fetch_incidents(&self) -> Result<Vec<Incident>> {
        let url = format!(
            "{BASE_URL}?resource_id={}&limit={}",
            self.settings.resource_id, self.settings.record_limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET datastore_search request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse datastore_search response body")?;

        if !status.is_success() {
            anyhow::bail!("Montréal open data returned {}: {}", status, body);
        }

        parse_records(&body)
    }

    /// Fetch incidents and build one observation per postal code.
    pub async fn fetch(&self, districts: &[District]) -> Result<Vec<RawObservation>> {
        let (incidents, confidence) = match self.fetch_incidents().await {
            Ok(incidents) => (incidents, 1.0),
            Err(e) if self.settings.fallback => {
                warn!(error = %e, "traffic feed unavailable, using fallback incidents");
                (fallback_incidents(), self.settings.fallback_confidence)
            }
            Err(e) => return Err(e),
        };

        for incident in incidents.iter().filter(|i| i.severity == IncidentSeverity::High) {
            debug!(
                location = %incident.location,
                kind = %incident.incident_type,
                severity = %incident.severity,
                "high-severity incident"
            );
        }

        let counts = count_by_district(
            &incidents,
            districts,
            self.settings.match_radius_km,
            self.settings.min_severity,
        );
        debug!(
            incidents = incidents.len(),
            counts = ?counts,
            confidence,
            "traffic incidents attributed"
        );
        Ok(district_observations(districts, &counts, confidence, Utc::now()))
    }
}
