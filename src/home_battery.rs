//! Home battery reservation and dynamic minimum SoC
//!
//! Hourly energy simulation over the surplus forecast. Charging within an
//! hour is limited by the battery's maximum charging power; discharging is
//! not rate limited by this model.

use crate::config::HomeBatteryConfig;
use crate::forecast::{ForecastProvider, SunEvent, SurplusForecast};
use crate::interval::{hours, overlap};
use crate::schedule::ChargingSchedule;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};

const SLICE_HOURS: i64 = 1;

fn slice() -> TimeDelta {
    TimeDelta::hours(SLICE_HOURS)
}

/// Static battery parameters, present only when capacity is configured
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryModel {
    pub capacity_wh: f64,
    pub max_charging_power_w: f64,
    /// Configured minimum SoC, the floor of every dynamic value
    pub floor_soc_percent: f64,
    pub max_dynamic_min_soc_percent: f64,
    pub buffer_fraction: f64,
}

impl BatteryModel {
    /// `None` disables every home battery computation
    pub fn from_config(config: &HomeBatteryConfig) -> Option<Self> {
        let capacity_wh = config.usable_energy_wh.filter(|e| *e > 0.0)?;
        Some(Self {
            capacity_wh,
            max_charging_power_w: config.max_charging_power_w.unwrap_or(f64::INFINITY),
            floor_soc_percent: config.min_soc_percent.unwrap_or(0.0),
            max_dynamic_min_soc_percent: config.max_dynamic_min_soc_percent,
            buffer_fraction: config.dynamic_min_soc_buffer_percent / 100.0,
        })
    }

    /// Apply `delta_wh` over `slice_hours`. Charging is capped at the maximum
    /// charging power, discharging is applied as is.
    pub fn apply_energy_change(&self, energy_wh: f64, delta_wh: f64, slice_hours: f64) -> f64 {
        if delta_wh > 0.0 {
            energy_wh + delta_wh.min(self.max_charging_power_w * slice_hours)
        } else {
            energy_wh + delta_wh
        }
    }

    fn to_percent(&self, energy_wh: f64) -> f64 {
        energy_wh / self.capacity_wh * 100.0
    }

    fn to_energy(&self, percent: f64) -> f64 {
        self.capacity_wh * percent / 100.0
    }

    /// Minimum SoC to hold now so the battery reaches `target_time` without
    /// dropping below the floor and at or above `target_soc_percent`.
    ///
    /// The result always lies in `[floor, max(max_dynamic, floor)]`.
    pub fn required_initial_soc_percent(
        &self,
        forecast: &SurplusForecast,
        now: DateTime<Utc>,
        target_soc_percent: f64,
        target_time: DateTime<Utc>,
    ) -> f64 {
        let floor = self.floor_soc_percent;
        let ceiling = self.max_dynamic_min_soc_percent.max(floor);
        let floor_wh = self.to_energy(floor);

        let mut energy = floor_wh;
        let mut max_missing = 0.0_f64;
        let mut headroom = self.capacity_wh - floor_wh;

        for (start, watts) in forecast.range(..target_time) {
            let h = hours(overlap(*start, *start + slice(), now, target_time));
            if h <= 0.0 {
                continue;
            }
            energy = self.apply_energy_change(energy, watts * h, h);
            if energy > self.capacity_wh {
                // The battery fills up anyway; a higher minimum only wastes headroom
                return floor;
            }
            max_missing = max_missing.max(floor_wh - energy);
            headroom = headroom.min(self.capacity_wh - energy);
        }

        let target_wh = self.to_energy(target_soc_percent);
        if energy < target_wh {
            max_missing = max_missing.max(target_wh - energy);
        }

        let raise = headroom.min(max_missing).max(0.0) * (1.0 + self.buffer_fraction);
        self.to_percent(floor_wh + raise).clamp(floor, ceiling)
    }

    /// Projected SoC at `future`, starting from `current_soc_percent` now and
    /// subtracting the energy planned for charging schedules
    pub fn estimated_soc_at(
        &self,
        forecast: &SurplusForecast,
        now: DateTime<Utc>,
        future: DateTime<Utc>,
        current_soc_percent: f64,
        schedules: &[ChargingSchedule],
    ) -> f64 {
        let mut energy = self
            .to_energy(current_soc_percent)
            .clamp(0.0, self.capacity_wh);
        let mut cursor = now.duration_trunc(slice()).unwrap_or(now);

        while cursor < future {
            let seg_from = cursor.max(now);
            let seg_to = (cursor + slice()).min(future);
            let h = hours(seg_to - seg_from);
            if h > 0.0 {
                // Unknown hours contribute no solar energy
                let solar = forecast.get(&cursor).map(|w| w * h).unwrap_or(0.0);
                let charging: f64 = schedules
                    .iter()
                    .map(|s| {
                        s.charging_power * hours(overlap(s.valid_from, s.valid_to, seg_from, seg_to))
                    })
                    .sum();
                energy = self
                    .apply_energy_change(energy, solar - charging, h)
                    .clamp(0.0, self.capacity_wh);
            }
            cursor += slice();
        }

        self.to_percent(energy)
    }

    /// Dynamic minimum SoC for the next sun event.
    ///
    /// The target is the next sunrise at floor SoC. With `force_full_by_sunset`
    /// and sunset coming first, the target becomes full charge at the first
    /// hour with positive surplus from the sunset hour onward.
    pub fn dynamic_min_soc_at(
        &self,
        forecast: &SurplusForecast,
        now: DateTime<Utc>,
        next_sunrise: Option<DateTime<Utc>>,
        next_sunset: Option<DateTime<Utc>>,
        force_full_by_sunset: bool,
    ) -> f64 {
        let (target_time, target_soc) = match (next_sunrise, next_sunset) {
            (sunrise, Some(sunset))
                if force_full_by_sunset && sunrise.is_none_or(|rise| sunset < rise) =>
            {
                let start = sunset.duration_trunc(slice()).unwrap_or(sunset);
                let first_positive = (0..24)
                    .map(|i| start + TimeDelta::hours(i * SLICE_HOURS))
                    .find(|at| forecast.get(at).is_some_and(|w| *w > 0.0));
                (first_positive.unwrap_or(sunset), 100.0)
            }
            (Some(sunrise), _) => (sunrise, self.floor_soc_percent),
            (None, _) => return self.floor_soc_percent,
        };

        if target_time <= now {
            return self.floor_soc_percent;
        }
        self.required_initial_soc_percent(forecast, now, target_soc, target_time)
    }
}

/// First occurrence of `event` after `now`, looking at today and tomorrow
pub fn next_sun_event(
    provider: &dyn ForecastProvider,
    event: SunEvent,
    latitude: f64,
    longitude: f64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    (0..=1).find_map(|days_ahead| {
        provider
            .sun_event(event, latitude, longitude, now.date_naive(), days_ahead)
            .filter(|at| *at > now)
    })
}
