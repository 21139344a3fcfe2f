// =============================================================================
// Stock Collector — Alpha Vantage quotes for the insurer basket
// =============================================================================
//
// The market signal is the mean single-day percent change across the basket.
// It is city-wide: the same value is attached to every postal code.
//
// Confidence = coverage (quotes received / symbols requested) decayed by the
// age of the latest trading day, so a Friday close read on Monday morning
// weighs less than a fresh one.
//
// The free tier allows 5 requests per minute, so quotes are fetched one at a
// time with a fixed spacing.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, instrument, warn};

use crate::signals::{ConfidenceDecay, RawObservation};
use crate::types::SignalSource;

const BASE_URL: &str = "https://www.alphavantage.co/query";

/// One GLOBAL_QUOTE answer.
#[derive(Debug, Clone, PartialEq)]
pub struct StockQuote {
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub latest_trading_day: NaiveDate,
}

impl StockQuote {
    /// Coarse rating by absolute daily move.
    pub fn risk_rating(&self) -> &'static str {
        let moved = self.change_percent.abs();
        if moved > 5.0 {
            "High"
        } else if moved > 2.0 {
            "Medium"
        } else {
            "Low"
        }
    }
}

/// Aggregate view of the quotes received in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct BasketSummary {
    pub mean_change_pct: f64,
    /// Fraction of requested symbols that returned a quote.
    pub coverage: f64,
    pub latest_trading_day: NaiveDate,
}

fn quote_field<'a>(
    quote: &'a serde_json::Map<String, serde_json::Value>,
    symbol: &str,
    name: &str,
) -> Result<&'a str> {
    quote
        .get(name)
        .and_then(|v| v.as_str())
        .with_context(|| format!("quote for {symbol} missing '{name}'"))
}

/// Parse a GLOBAL_QUOTE response body.
pub fn parse_global_quote(symbol: &str, body: &serde_json::Value) -> Result<StockQuote> {
    for refusal in ["Note", "Information", "Error Message"] {
        if let Some(msg) = body.get(refusal).and_then(|v| v.as_str()) {
            anyhow::bail!("Alpha Vantage refused {symbol}: {msg}");
        }
    }

    let quote = body
        .get("Global Quote")
        .and_then(|v| v.as_object())
        .with_context(|| format!("no 'Global Quote' object for {symbol}"))?;
    if quote.is_empty() {
        anyhow::bail!("empty quote for {symbol}");
    }

    let field = |name: &str| quote_field(quote, symbol, name);

    let price: f64 = field("05. price")?
        .trim()
        .parse()
        .with_context(|| format!("bad price for {symbol}"))?;
    let change_percent: f64 = field("10. change percent")?
        .trim()
        .trim_end_matches('%')
        .parse()
        .with_context(|| format!("bad change percent for {symbol}"))?;
    let latest_trading_day = NaiveDate::parse_from_str(field("07. latest trading day")?, "%Y-%m-%d")
        .with_context(|| format!("bad trading day for {symbol}"))?;

    Ok(StockQuote {
        symbol: symbol.to_string(),
        price,
        change_percent,
        latest_trading_day,
    })
}

/// Summarise the quotes received against the number requested.
pub fn summarize(quotes: &[StockQuote], requested: usize) -> Option<BasketSummary> {
    if quotes.is_empty() || requested == 0 {
        return None;
    }
    let mean_change_pct =
        quotes.iter().map(|q| q.change_percent).sum::<f64>() / quotes.len() as f64;
    let latest_trading_day = quotes.iter().map(|q| q.latest_trading_day).max()?;
    Some(BasketSummary {
        mean_change_pct,
        coverage: (quotes.len() as f64 / requested as f64).min(1.0),
        latest_trading_day,
    })
}

/// Attach the basket signal to every postal code.
pub fn basket_observations(
    summary: &BasketSummary,
    postal_codes: &[String],
    decay: &ConfidenceDecay,
    now: DateTime<Utc>,
) -> Vec<RawObservation> {
    // TSX closes at 16:00 Eastern, ~21:00 UTC.
    let closed_at = summary
        .latest_trading_day
        .and_hms_opt(21, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    let confidence = decay.apply(summary.coverage, closed_at, now);

    postal_codes
        .iter()
        .map(|pc| RawObservation {
            source: SignalSource::Stock,
            postal_code: pc.clone(),
            timestamp: now,
            raw_value: summary.mean_change_pct,
            confidence,
        })
        .collect()
}

/// Fetches quotes for the configured basket.
#[derive(Clone)]
pub struct StockClient {
    client: reqwest::Client,
    api_key: Option<String>,
    spacing: Duration,
    decay: ConfidenceDecay,
}

impl StockClient {
    pub fn with_client(
        client: reqwest::Client,
        api_key: Option<String>,
        spacing: Duration,
        decay: ConfidenceDecay,
    ) -> Self {
        Self {
            client,
            api_key,
            spacing,
            decay,
        }
    }

    #[instrument(skip(self), name = "stock::fetch_quote")]
    async fn fetch_quote(&self, symbol: &str) -> Result<StockQuote> {
        let key = self
            .api_key
            .as_deref()
            .context("ALPHAVANTAGE_API_KEY is not set")?;
        // Key as a query parameter; URLs are stripped from transport errors.
        let resp = self
            .client
            .get(BASE_URL)
            .query(&[("function", "GLOBAL_QUOTE"), ("symbol", symbol), ("apikey", key)])
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("GET quote for {symbol}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("failed to parse quote response body")?;

        if !status.is_success() {
            anyhow::bail!("Alpha Vantage returned {}: {}", status, body);
        }

        parse_global_quote(symbol, &body)
    }

    /// Fetch the basket and build one observation per postal code.
    pub async fn fetch(
        &self,
        symbols: &[String],
        postal_codes: &[String],
    ) -> Result<Vec<RawObservation>> {
        if self.api_key.is_none() {
            anyhow::bail!("ALPHAVANTAGE_API_KEY is not set");
        }

        let mut quotes = Vec::with_capacity(symbols.len());
        for (i, symbol) in symbols.iter().enumerate() {
            if i > 0 && !self.spacing.is_zero() {
                tokio::time::sleep(self.spacing).await;
            }
            match self.fetch_quote(symbol).await {
                Ok(q) => {
                    debug!(
                        symbol = %q.symbol,
                        price = q.price,
                        change_pct = q.change_percent,
                        rating = q.risk_rating(),
                        "quote received"
                    );
                    quotes.push(q);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "quote fetch failed"),
            }
        }

        let summary = summarize(&quotes, symbols.len())
            .context("no quotes received for the insurer basket")?;
        debug!(
            mean_change_pct = summary.mean_change_pct,
            coverage = summary.coverage,
            "basket summarised"
        );
        Ok(basket_observations(&summary, postal_codes, &self.decay, Utc::now()))
    }
}

impl std::fmt::Debug for StockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockClient")
            .field("api_key", &"<redacted>")
            .field("spacing", &self.spacing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote(symbol: &str, change: f64, day: &str) -> StockQuote {
        StockQuote {
            symbol: symbol.into(),
            price: 100.0,
            change_percent: change,
            latest_trading_day: NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap(),
        }
    }

    #[test]
    fn parses_global_quote() {
        let body = json!({
            "Global Quote": {
                "01. symbol": "IFC.TO",
                "05. price": "251.3000",
                "07. latest trading day": "2024-05-10",
                "09. change": "-3.1200",
                "10. change percent": "-1.2262%"
            }
        });
        let q = parse_global_quote("IFC.TO", &body).unwrap();
        assert!((q.price - 251.3).abs() < 1e-9);
        assert!((q.change_percent + 1.2262).abs() < 1e-9);
        assert_eq!(q.latest_trading_day.to_string(), "2024-05-10");
        assert_eq!(q.risk_rating(), "Low");
    }

    #[test]
    fn rate_limit_note_is_an_error() {
        let body = json!({ "Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute" });
        let err = parse_global_quote("MFC.TO", &body).unwrap_err();
        assert!(err.to_string().contains("refused MFC.TO"));
    }

    #[test]
    fn empty_quote_is_an_error() {
        assert!(parse_global_quote("HCG.TO", &json!({ "Global Quote": {} })).is_err());
    }

    #[test]
    fn risk_rating_bands() {
        assert_eq!(quote("A", -5.5, "2024-05-10").risk_rating(), "High");
        assert_eq!(quote("A", 3.0, "2024-05-10").risk_rating(), "Medium");
        assert_eq!(quote("A", -2.0, "2024-05-10").risk_rating(), "Low");
    }

    #[test]
    fn summary_averages_and_reports_coverage() {
        let quotes = vec![
            quote("A", -2.0, "2024-05-09"),
            quote("B", -4.0, "2024-05-10"),
        ];
        let s = summarize(&quotes, 4).unwrap();
        assert!((s.mean_change_pct + 3.0).abs() < 1e-12);
        assert!((s.coverage - 0.5).abs() < 1e-12);
        assert_eq!(s.latest_trading_day.to_string(), "2024-05-10");
        assert!(summarize(&[], 4).is_none());
    }

    #[test]
    fn observations_carry_coverage_and_staleness() {
        let summary = BasketSummary {
            mean_change_pct: -3.0,
            coverage: 0.5,
            latest_trading_day: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
        };
        let now = NaiveDate::from_ymd_opt(2024, 5, 10)
            .unwrap()
            .and_hms_opt(22, 0, 0)
            .unwrap()
            .and_utc();
        let codes = vec!["H3A".to_string(), "H8N".to_string()];

        let fresh = basket_observations(&summary, &codes, &ConfidenceDecay::new(0.0), now);
        assert_eq!(fresh.len(), 2);
        assert!((fresh[0].confidence - 0.5).abs() < 1e-12);
        assert!((fresh[0].raw_value + 3.0).abs() < 1e-12);

        // One hour after close with a one-hour half-life.
        let decayed = basket_observations(&summary, &codes, &ConfidenceDecay::new(3600.0), now);
        assert!((decayed[1].confidence - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_api_key_fails_the_source() {
        let client = StockClient::with_client(
            reqwest::Client::new(),
            None,
            Duration::ZERO,
            ConfidenceDecay::default(),
        );
        let res = client
            .fetch(&["IFC.TO".to_string()], &["H3A".to_string()])
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn transport_failure_does_not_leak_the_api_key() {
        let http = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all("http://127.0.0.1:9").unwrap())
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let client = StockClient::with_client(
            http,
            Some("SECRETKEY123".into()),
            Duration::ZERO,
            ConfidenceDecay::default(),
        );

        let err = client.fetch_quote("IFC.TO").await.unwrap_err();
        let reason = format!("{err:#}");
        assert!(reason.contains("GET quote for IFC.TO"), "{reason}");
        assert!(!reason.contains("SECRETKEY123"), "{reason}");
    }
}
