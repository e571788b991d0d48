//! Solar surplus forecast contract
//!
//! The forecast model itself lives outside the engine. Providers only deliver
//! predicted net surplus (solar production minus household consumption) per
//! time slice, plus sunrise and sunset instants.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Predicted surplus in watts keyed by slice start
pub type SurplusForecast = BTreeMap<DateTime<Utc>, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SunEvent {
    Sunrise,
    Sunset,
}

#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Average predicted surplus per slice of length `slice` in `[from, to)`.
    /// Slices the model knows nothing about are simply absent.
    async fn predicted_surplus_per_slice(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        slice: TimeDelta,
    ) -> Result<SurplusForecast>;

    /// Instant of `event` on `date + days_ahead` at the given location
    fn sun_event(
        &self,
        event: SunEvent,
        latitude: f64,
        longitude: f64,
        date: NaiveDate,
        days_ahead: u32,
    ) -> Option<DateTime<Utc>>;
}

/// Provider used when no forecast source is wired in
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForecast;

#[async_trait]
impl ForecastProvider for NoForecast {
    async fn predicted_surplus_per_slice(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        _slice: TimeDelta,
    ) -> Result<SurplusForecast> {
        Ok(SurplusForecast::new())
    }

    fn sun_event(
        &self,
        _event: SunEvent,
        _latitude: f64,
        _longitude: f64,
        _date: NaiveDate,
        _days_ahead: u32,
    ) -> Option<DateTime<Utc>> {
        None
    }
}

/// In-memory forecast with a fixed hourly profile and fixed sun times.
///
/// Handy for replaying recorded forecasts and for tests.
#[derive(Debug, Clone, Default)]
pub struct FixedForecast {
    pub hourly: SurplusForecast,
    pub sunrises: Vec<DateTime<Utc>>,
    pub sunsets: Vec<DateTime<Utc>>,
}

#[async_trait]
impl ForecastProvider for FixedForecast {
    async fn predicted_surplus_per_slice(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        _slice: TimeDelta,
    ) -> Result<SurplusForecast> {
        Ok(self
            .hourly
            .range(from..to)
            .map(|(at, watts)| (*at, *watts))
            .collect())
    }

    fn sun_event(
        &self,
        event: SunEvent,
        _latitude: f64,
        _longitude: f64,
        date: NaiveDate,
        days_ahead: u32,
    ) -> Option<DateTime<Utc>> {
        let day = date + TimeDelta::days(i64::from(days_ahead));
        let events = match event {
            SunEvent::Sunrise => &self.sunrises,
            SunEvent::Sunset => &self.sunsets,
        };
        events.iter().copied().find(|at| at.date_naive() == day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn fixed_forecast_filters_range_and_days() {
        let at = |h| Utc.with_ymd_and_hms(2026, 6, 1, h, 0, 0).unwrap();
        let forecast = FixedForecast {
            hourly: (6..20).map(|h| (at(h), 1000.0)).collect(),
            sunrises: vec![at(4), Utc.with_ymd_and_hms(2026, 6, 2, 4, 1, 0).unwrap()],
            sunsets: vec![at(20)],
        };

        let slice = forecast
            .predicted_surplus_per_slice(at(10), at(12), TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(slice.len(), 2);

        let date = at(0).date_naive();
        assert_eq!(
            forecast.sun_event(SunEvent::Sunrise, 0.0, 0.0, date, 1),
            Some(Utc.with_ymd_and_hms(2026, 6, 2, 4, 1, 0).unwrap())
        );
        assert_eq!(forecast.sun_event(SunEvent::Sunset, 0.0, 0.0, date, 1), None);
    }
}
