//! Charging schedules
//!
//! A schedule is a planned charging power for one loadpoint over a half-open
//! interval. The set for all loadpoints is regenerated every tick and
//! published as a whole through [`crate::state::StateStore`].

mod generator;
mod merge;
mod switch_times;

pub use generator::{GeneratorSettings, LoadpointPlan, BatteryOutlook, generate_schedules};
pub use merge::{add_charging_schedule, coalesce};
pub use switch_times::{SwitchCandidate, optimize_charging_switch_times};

use crate::interval::{TimeInterval, hours};
use crate::loadpoint::LoadpointRef;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargingSchedule {
    pub loadpoint: LoadpointRef,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    /// Planned power in watts
    pub charging_power: f64,
    /// Power that must be drawn even from the grid; `None` for
    /// surplus-only slices
    pub target_min_power: Option<f64>,
    /// Surplus expected to cover this slice
    pub estimated_solar_power: Option<f64>,
}

impl ChargingSchedule {
    pub fn new(
        loadpoint: LoadpointRef,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        charging_power: f64,
    ) -> Self {
        Self {
            loadpoint,
            valid_from,
            valid_to,
            charging_power,
            target_min_power: None,
            estimated_solar_power: None,
        }
    }

    pub fn with_target_min_power(mut self, watts: f64) -> Self {
        self.target_min_power = Some(watts);
        self
    }

    pub fn with_estimated_solar_power(mut self, watts: f64) -> Self {
        self.estimated_solar_power = Some(watts);
        self
    }

    pub fn energy_wh(&self) -> f64 {
        self.charging_power * hours(self.duration())
    }
}

impl TimeInterval for ChargingSchedule {
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
            ..self.clone()
        }
    }
}

/// Slot of `loadpoint` active at `instant`
pub fn active_at(
    schedules: &[ChargingSchedule],
    loadpoint: LoadpointRef,
    instant: DateTime<Utc>,
) -> Option<&ChargingSchedule> {
    schedules
        .iter()
        .find(|s| s.loadpoint == loadpoint && s.contains(instant))
}

/// Earliest slot of `loadpoint` starting after `instant`
pub fn next_after(
    schedules: &[ChargingSchedule],
    loadpoint: LoadpointRef,
    instant: DateTime<Utc>,
) -> Option<&ChargingSchedule> {
    schedules
        .iter()
        .filter(|s| s.loadpoint == loadpoint && s.valid_from > instant)
        .min_by_key(|s| s.valid_from)
}

/// `delta` scaled by `factor`, at millisecond resolution
pub(crate) fn scaled(delta: TimeDelta, factor: f64) -> TimeDelta {
    TimeDelta::milliseconds((delta.num_milliseconds() as f64 * factor).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadpoint::CarId;
    use chrono::TimeZone;

    fn h(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).unwrap()
    }

    #[test]
    fn lookup_by_instant() {
        let car = LoadpointRef::Car(CarId(1));
        let other = LoadpointRef::Car(CarId(2));
        let schedules = vec![
            ChargingSchedule::new(car, h(10), h(11), 3000.0),
            ChargingSchedule::new(car, h(13), h(14), 4000.0),
            ChargingSchedule::new(other, h(11), h(12), 5000.0),
        ];

        assert_eq!(active_at(&schedules, car, h(10)).map(|s| s.charging_power), Some(3000.0));
        assert!(active_at(&schedules, car, h(11)).is_none());
        assert_eq!(next_after(&schedules, car, h(10)).map(|s| s.valid_from), Some(h(13)));
        assert_eq!(schedules[0].energy_wh(), 3000.0);
        assert_eq!(scaled(TimeDelta::hours(2), 0.25), TimeDelta::minutes(30));
    }
}
