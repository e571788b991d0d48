//! Tibber API integration for dynamic electricity pricing
//!
//! Queries the `priceInfo` of the account's home over GraphQL and exposes
//! today's and tomorrow's tariff as [`PriceInterval`]s. Tibber publishes the
//! next day around noon, so the curve regularly ends before a far deadline.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::config::TibberConfig;
use crate::error::{HelioError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::pricing::{PriceInterval, PriceProvider};

const PRICE_QUERY: &str = r#"
query PriceInfoQuery {
    viewer {
        homes {
            id
            currentSubscription {
                priceInfo {
                    today { total startsAt }
                    tomorrow { total startsAt }
                }
            }
        }
    }
}
"#;

/// Retry delay after a failed request
const RETRY_AFTER: TimeDelta = TimeDelta::minutes(1);

#[derive(Debug, Default)]
struct PriceCache {
    intervals: Vec<PriceInterval>,
    next_refresh: Option<DateTime<Utc>>,
}

/// [`PriceProvider`] backed by the Tibber GraphQL API
pub struct TibberPriceProvider {
    access_token: String,
    home_id: Option<String>,
    api_url: String,
    http: reqwest::Client,
    logger: StructuredLogger,
    cache: Mutex<PriceCache>,
}

impl TibberPriceProvider {
    pub fn new(config: &TibberConfig) -> Result<Self> {
        if config.access_token.trim().is_empty() {
            return Err(HelioError::config("Tibber access token missing"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            access_token: config.access_token.trim().to_string(),
            home_id: Some(config.home_id.clone()).filter(|id| !id.is_empty()),
            api_url: config.api_url.clone(),
            http,
            logger: get_logger("tibber"),
            cache: Mutex::new(PriceCache::default()),
        })
    }

    async fn fetch(&self) -> Result<Vec<PriceInterval>> {
        let resp = self
            .http
            .post(&self.api_url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, concat!("heliocharge/", env!("CARGO_PKG_VERSION")))
            .json(&json!({ "query": PRICE_QUERY, "variables": {} }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(HelioError::api(format!("Tibber API error: {}", resp.status())));
        }
        let body: Value = resp.json().await?;
        parse_price_info(&body, self.home_id.as_deref())
    }
}

#[async_trait]
impl PriceProvider for TibberPriceProvider {
    async fn prices(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PriceInterval>> {
        let mut cache = self.cache.lock().await;
        let due = cache.next_refresh.is_none_or(|at| from >= at);
        if due {
            match self.fetch().await {
                Ok(intervals) => {
                    self.logger
                        .debug(&format!("Fetched {} Tibber price intervals", intervals.len()));
                    cache.next_refresh = Some(next_refresh(&intervals, from));
                    cache.intervals = intervals;
                }
                Err(e) if !cache.intervals.is_empty() => {
                    self.logger
                        .warn(&format!("Tibber refresh failed, using cached prices: {}", e));
                    cache.next_refresh = Some(from + RETRY_AFTER);
                }
                Err(e) => {
                    cache.next_refresh = Some(from + RETRY_AFTER);
                    return Err(e);
                }
            }
        }

        Ok(cache
            .intervals
            .iter()
            .filter(|p| p.valid_to > from && p.valid_from < to)
            .cloned()
            .collect())
    }
}

/// Refresh hourly until tomorrow's prices appear, then once the curve runs
/// out
fn next_refresh(intervals: &[PriceInterval], now: DateTime<Utc>) -> DateTime<Utc> {
    let end = intervals.iter().map(|p| p.valid_to).max();
    match end {
        Some(end) if end - now > TimeDelta::hours(24) => end - TimeDelta::hours(12),
        _ => now + TimeDelta::hours(1),
    }
}

/// Turn a `priceInfo` response into sorted, contiguous intervals.
///
/// Each entry lasts until the next one starts; the last entry keeps the
/// length of its predecessor, or one hour when it stands alone.
pub fn parse_price_info(body: &Value, home_id: Option<&str>) -> Result<Vec<PriceInterval>> {
    if let Some(msg) = body
        .get("errors")
        .and_then(|e| e.get(0))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return Err(HelioError::api(format!("Tibber GraphQL error: {}", msg)));
    }

    let homes = body
        .pointer("/data/viewer/homes")
        .and_then(Value::as_array)
        .ok_or_else(|| HelioError::price("No homes in Tibber account"))?;
    let home = home_id
        .and_then(|id| {
            homes
                .iter()
                .find(|h| h.get("id").and_then(Value::as_str) == Some(id))
        })
        .or_else(|| homes.first())
        .ok_or_else(|| HelioError::price("No homes in Tibber account"))?;
    let info = home
        .pointer("/currentSubscription/priceInfo")
        .ok_or_else(|| HelioError::price("Tibber home has no active subscription"))?;

    let mut points: Vec<(DateTime<Utc>, f64)> = ["today", "tomorrow"]
        .iter()
        .filter_map(|key| info.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(|entry| {
            let starts = entry.get("startsAt").and_then(Value::as_str)?;
            let total = entry.get("total").and_then(Value::as_f64)?;
            let starts = DateTime::parse_from_rfc3339(starts).ok()?;
            Some((starts.with_timezone(&Utc), total))
        })
        .collect();
    points.sort_by_key(|(at, _)| *at);
    points.dedup_by_key(|(at, _)| *at);

    let mut intervals = Vec::with_capacity(points.len());
    let mut last_len = TimeDelta::hours(1);
    for (i, (start, price)) in points.iter().enumerate() {
        let end = match points.get(i + 1) {
            Some((next, _)) => *next,
            None => *start + last_len,
        };
        last_len = end - *start;
        intervals.push(PriceInterval {
            valid_from: *start,
            valid_to: end,
            grid_price: *price,
        });
    }
    Ok(intervals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn body() -> Value {
        json!({
            "data": { "viewer": { "homes": [
                { "id": "other", "currentSubscription": { "priceInfo": {
                    "today": [ { "total": 9.0, "startsAt": "2026-03-14T00:00:00.000+01:00" } ],
                    "tomorrow": []
                } } },
                { "id": "home-1", "currentSubscription": { "priceInfo": {
                    "today": [
                        { "total": 0.30, "startsAt": "2026-03-14T01:00:00.000+01:00" },
                        { "total": 0.25, "startsAt": "2026-03-14T00:00:00.000+01:00" }
                    ],
                    "tomorrow": [
                        { "total": 0.20, "startsAt": "2026-03-14T02:00:00.000+01:00" }
                    ]
                } } }
            ] } }
        })
    }

    #[test]
    fn parses_selected_home_sorted() {
        let intervals = parse_price_info(&body(), Some("home-1")).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 13, 23, 0, 0).unwrap();

        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[0].valid_from, start);
        assert_eq!(intervals[0].grid_price, 0.25);
        assert_eq!(intervals[1].valid_from, intervals[0].valid_to);
        assert_eq!(intervals[2].valid_to, start + TimeDelta::hours(3));
    }

    #[test]
    fn unknown_home_falls_back_to_first() {
        let intervals = parse_price_info(&body(), Some("missing")).unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].grid_price, 9.0);
    }

    #[test]
    fn graphql_errors_are_reported() {
        let body = json!({ "errors": [ { "message": "invalid token" } ] });
        let err = parse_price_info(&body, None).unwrap_err();
        assert!(err.to_string().contains("invalid token"));
    }

    #[test]
    fn refresh_waits_for_tomorrow() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
        let today_only = [PriceInterval {
            valid_from: now,
            valid_to: now + TimeDelta::hours(15),
            grid_price: 0.3,
        }];
        assert_eq!(next_refresh(&today_only, now), now + TimeDelta::hours(1));

        let with_tomorrow = [PriceInterval {
            valid_from: now,
            valid_to: now + TimeDelta::hours(39),
            grid_price: 0.3,
        }];
        assert_eq!(
            next_refresh(&with_tomorrow, now),
            now + TimeDelta::hours(27)
        );
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let config = TibberConfig::default();
        assert!(TibberPriceProvider::new(&config).is_err());
    }
}
