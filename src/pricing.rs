//! Grid price curves

use crate::error::Result;
use crate::interval::TimeInterval;
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Grid import price over `[valid_from, valid_to)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceInterval {
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    /// Price per kWh
    pub grid_price: f64,
}

impl TimeInterval for PriceInterval {
    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to
    }

    fn with_bounds(&self, valid_from: DateTime<Utc>, valid_to: DateTime<Utc>) -> Self {
        Self {
            valid_from,
            valid_to,
            grid_price: self.grid_price,
        }
    }
}

/// Source of grid price curves
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Price intervals overlapping `[from, to)`, ordered by `valid_from`.
    /// The list may end before `to` when the tariff is not published yet.
    async fn prices(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PriceInterval>>;
}

/// Whether the curve reaches `deadline`
pub fn covers_until(prices: &[PriceInterval], deadline: DateTime<Utc>) -> bool {
    prices.iter().map(|p| p.valid_to).max().is_some_and(|end| end >= deadline)
}

/// Flat tariff expressed as hourly intervals
#[derive(Debug, Clone)]
pub struct StaticPriceProvider {
    price: f64,
}

impl StaticPriceProvider {
    pub fn new(price: f64) -> Self {
        Self { price }
    }
}

#[async_trait]
impl PriceProvider for StaticPriceProvider {
    async fn prices(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PriceInterval>> {
        let hour = TimeDelta::hours(1);
        let mut cursor = from.duration_trunc(hour).unwrap_or(from);
        let mut out = Vec::new();
        while cursor < to {
            out.push(PriceInterval {
                valid_from: cursor,
                valid_to: cursor + hour,
                grid_price: self.price,
            });
            cursor += hour;
        }
        Ok(out)
    }
}
