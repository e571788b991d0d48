//! Schedule generation for loadpoints with a pending charging target
//!
//! Loadpoints are planned one after another in priority order. Each one
//! first takes forecast solar surplus, then fills the rest from the grid,
//! either in the cheapest price slices or as soon as possible.

use super::merge::{add_charging_schedule, energy_added};
use super::{ChargingSchedule, scaled};
use crate::config::Config;
use crate::forecast::SurplusForecast;
use crate::home_battery::BatteryModel;
use crate::interval::{TimeInterval, hours, split_by_boundaries};
use crate::loadpoint::{ConstraintValues, LoadpointRef};
use crate::pricing::{PriceInterval, covers_until};
use crate::reasons::ReasonCollector;
use crate::targets::TimeZonedChargingTarget;
use chrono::{DateTime, TimeDelta, Utc};

/// Energy below this is treated as done
const ENERGY_EPSILON_WH: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorSettings {
    pub nominal_voltage: f64,
    pub charge_loss_percent: f64,
    pub use_solar_prediction: bool,
    pub use_price_optimization: bool,
}

impl GeneratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            nominal_voltage: config.control.nominal_voltage,
            charge_loss_percent: config.charging.charge_loss_percent,
            use_solar_prediction: config.charging.use_solar_prediction,
            use_price_optimization: config.charging.use_price_optimization,
        }
    }
}

/// A loadpoint eligible for target planning: automatic mode, plugged in,
/// at home, with known SoC and battery size
#[derive(Debug, Clone, PartialEq)]
pub struct LoadpointPlan {
    pub loadpoint: LoadpointRef,
    pub priority: i32,
    pub constraints: ConstraintValues,
    pub soc_percent: f64,
    pub usable_energy_wh: f64,
    pub car_soc_limit: Option<f64>,
    pub charging: bool,
    pub target: TimeZonedChargingTarget,
}

impl LoadpointPlan {
    /// Target SoC actually planned for. A target equal to the car's own limit
    /// is raised by one point while charging so the car keeps going.
    pub fn effective_target_soc(&self) -> f64 {
        let target = self.target.target_soc;
        if self.charging && self.car_soc_limit == Some(target) {
            target + 1.0
        } else {
            target
        }
    }

    /// Energy to take from the supply, charging losses included
    pub fn required_energy_wh(&self, charge_loss_percent: f64) -> f64 {
        let missing = (self.effective_target_soc() - self.soc_percent) / 100.0;
        (missing * self.usable_energy_wh * (1.0 + charge_loss_percent / 100.0)).max(0.0)
    }
}

/// Home battery state that reduces the surplus available to cars
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryOutlook {
    pub model: BatteryModel,
    pub soc_percent: f64,
    pub min_soc_percent: f64,
}

/// Surplus left for cars once the home battery has been refilled to its
/// minimum. The battery is projected along `schedules`, so slots already
/// planned for other loadpoints count as drain.
fn surplus_for_cars(
    forecast: &SurplusForecast,
    battery: Option<&BatteryOutlook>,
    now: DateTime<Utc>,
    schedules: &[ChargingSchedule],
) -> SurplusForecast {
    let Some(battery) = battery else {
        return forecast.clone();
    };
    forecast
        .iter()
        .map(|(start, watts)| {
            let projected = battery.model.estimated_soc_at(
                forecast,
                now,
                *start,
                battery.soc_percent,
                schedules,
            );
            let watts = if projected < battery.min_soc_percent {
                watts - battery.model.max_charging_power_w.min(watts.max(0.0))
            } else {
                *watts
            };
            (*start, watts)
        })
        .collect()
}

/// Build the schedule set for all `plans`.
///
/// `prices` is only consulted when price optimisation is enabled; a curve
/// that ends before a target's deadline leaves that target's grid energy
/// unplanned.
pub fn generate_schedules(
    now: DateTime<Utc>,
    plans: &[LoadpointPlan],
    forecast: &SurplusForecast,
    prices: Option<&[PriceInterval]>,
    battery: Option<&BatteryOutlook>,
    settings: &GeneratorSettings,
    reasons: &mut ReasonCollector,
) -> Vec<ChargingSchedule> {
    let mut schedules = Vec::new();
    // solar surplus already handed to higher priorities
    let mut taken = SurplusForecast::new();

    let mut ordered: Vec<&LoadpointPlan> = plans.iter().collect();
    ordered.sort_by_key(|p| p.priority);

    for plan in ordered {
        let lp = plan.loadpoint;
        let energy = plan.required_energy_wh(settings.charge_loss_percent);
        if energy <= ENERGY_EPSILON_WH {
            continue;
        }
        let max_power = plan.constraints.max_power(settings.nominal_voltage);
        let min_power = plan.constraints.min_power(settings.nominal_voltage);
        if max_power <= 0.0 {
            reasons.add(lp, "Maximum charging power is zero");
            continue;
        }

        let deadline = plan.target.deadline;
        if deadline <= now {
            let duration = scaled(TimeDelta::hours(1), energy / max_power);
            if duration > TimeDelta::zero() {
                let slot = ChargingSchedule::new(lp, now, now + duration, max_power)
                    .with_target_min_power(max_power);
                add_charging_schedule(&mut schedules, &slot, max_power);
            }
            reasons.add(lp, "Target deadline passed, charging at maximum power");
            continue;
        }

        let mut remaining = energy;
        if settings.use_solar_prediction {
            let mut surplus = surplus_for_cars(forecast, battery, now, &schedules);
            for (start, watts) in surplus.iter_mut() {
                *watts -= taken.get(start).copied().unwrap_or(0.0);
            }
            remaining = plan_solar(
                &mut schedules,
                &mut surplus,
                &mut taken,
                lp,
                now,
                deadline,
                (min_power, max_power),
                remaining,
            );
        }
        if remaining <= ENERGY_EPSILON_WH {
            continue;
        }

        if settings.use_price_optimization {
            match prices {
                Some(prices) if covers_until(prices, deadline) => {
                    remaining =
                        plan_cheapest(&mut schedules, prices, lp, now, deadline, max_power, remaining);
                }
                _ => {
                    reasons.add(lp, "Price data does not reach the target deadline");
                    continue;
                }
            }
        } else {
            remaining = plan_asap(&mut schedules, lp, now, deadline, max_power, remaining);
        }

        if remaining > ENERGY_EPSILON_WH {
            reasons.add(
                lp,
                format!("Target cannot be reached in time, {:.0} Wh short", remaining),
            );
        }
    }

    schedules
}

fn plan_solar(
    schedules: &mut Vec<ChargingSchedule>,
    surplus: &mut SurplusForecast,
    taken: &mut SurplusForecast,
    lp: LoadpointRef,
    now: DateTime<Utc>,
    deadline: DateTime<Utc>,
    (min_power, max_power): (f64, f64),
    mut remaining: f64,
) -> f64 {
    let slice = TimeDelta::hours(1);
    for (start, watts) in surplus.range_mut(..deadline) {
        let from = (*start).max(now);
        let mut to = (*start + slice).min(deadline);
        if to <= from || *watts <= min_power {
            continue;
        }
        let power = watts.min(max_power);
        let mut slot = ChargingSchedule::new(lp, from, to, power).with_estimated_solar_power(power);

        let would_add = energy_added(schedules, &slot, max_power);
        if would_add <= 0.0 {
            continue;
        }
        let mut used_fraction = 1.0;
        if would_add > remaining {
            used_fraction = remaining / would_add;
            to = from + scaled(to - from, used_fraction);
            if to <= from {
                break;
            }
            slot = slot.with_bounds(from, to);
        }

        remaining -= add_charging_schedule(schedules, &slot, max_power);
        *watts -= power * used_fraction;
        *taken.entry(*start).or_default() += power * used_fraction;
        if remaining <= ENERGY_EPSILON_WH {
            break;
        }
    }
    remaining
}

fn own_power(pieces: &[ChargingSchedule], from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    pieces
        .iter()
        .find(|s| s.valid_from == from && s.valid_to == to)
        .map(|s| s.charging_power)
        .unwrap_or(0.0)
}

fn own_schedules(schedules: &[ChargingSchedule], lp: LoadpointRef) -> Vec<ChargingSchedule> {
    schedules.iter().filter(|s| s.loadpoint == lp).cloned().collect()
}

/// Fill the cheapest slices first; among equal prices the later slice wins.
/// An overshooting slice is shortened at its start.
fn plan_cheapest(
    schedules: &mut Vec<ChargingSchedule>,
    prices: &[PriceInterval],
    lp: LoadpointRef,
    now: DateTime<Utc>,
    deadline: DateTime<Utc>,
    max_power: f64,
    mut remaining: f64,
) -> f64 {
    let well_formed: Vec<PriceInterval> = prices
        .iter()
        .filter(|p| p.valid_from < p.valid_to)
        .cloned()
        .collect();
    let own = own_schedules(schedules, lp);
    let (own_pieces, mut price_pieces) =
        split_by_boundaries(&own, &well_formed, now, deadline, false);

    price_pieces.sort_by(|a, b| {
        a.grid_price
            .total_cmp(&b.grid_price)
            .then(b.valid_from.cmp(&a.valid_from))
    });

    for piece in price_pieces {
        let capacity = max_power - own_power(&own_pieces, piece.valid_from, piece.valid_to);
        if capacity <= 0.0 {
            continue;
        }
        let would_add = capacity * hours(piece.duration());
        let mut from = piece.valid_from;
        if would_add > remaining {
            from = piece.valid_to - scaled(piece.duration(), remaining / would_add);
            if from >= piece.valid_to {
                break;
            }
        }
        let slot = ChargingSchedule::new(lp, from, piece.valid_to, max_power)
            .with_target_min_power(max_power);
        remaining -= add_charging_schedule(schedules, &slot, max_power);
        if remaining <= ENERGY_EPSILON_WH {
            break;
        }
    }
    remaining
}

/// Fill from now onward; the overshooting slice is shortened at its end
fn plan_asap(
    schedules: &mut Vec<ChargingSchedule>,
    lp: LoadpointRef,
    now: DateTime<Utc>,
    deadline: DateTime<Utc>,
    max_power: f64,
    mut remaining: f64,
) -> f64 {
    let own = own_schedules(schedules, lp);
    let window = ChargingSchedule::new(lp, now, deadline, max_power).with_target_min_power(max_power);
    let (own_pieces, window_pieces) =
        split_by_boundaries(&own, std::slice::from_ref(&window), now, deadline, false);

    for piece in window_pieces {
        let capacity = max_power - own_power(&own_pieces, piece.valid_from, piece.valid_to);
        if capacity <= 0.0 {
            continue;
        }
        let would_add = capacity * hours(piece.duration());
        let mut slot = piece;
        if would_add > remaining {
            let to = slot.valid_from + scaled(slot.duration(), remaining / would_add);
            if to <= slot.valid_from {
                break;
            }
            slot = slot.with_bounds(slot.valid_from, to);
        }
        remaining -= add_charging_schedule(schedules, &slot, max_power);
        if remaining <= ENERGY_EPSILON_WH {
            break;
        }
    }
    remaining
}
