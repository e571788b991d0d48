use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetInputs, HomeBatteryInputs, power_to_control};
use crate::dispatch::DispatchOutcome;
use crate::forecast::{SunEvent, SurplusForecast};
use crate::home_battery::next_sun_event;
use crate::hysteresis::{
    HysteresisDecision, HysteresisSettings, build_elements, calculate, record_decisions,
};
use crate::loadpoint::ChargeMode;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::pricing::PriceInterval;
use crate::reasons::ReasonCollector;
use crate::schedule::{
    BatteryOutlook, ChargingSchedule, GeneratorSettings, LoadpointPlan, SwitchCandidate,
    generate_schedules, optimize_charging_switch_times,
};
use crate::state::{EngineState, GeoPoint};
use crate::targets::nearest_unfulfilled;

use super::ChargeEngine;
use super::types::{DriverSnapshot, TickStepDurations};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// What a tick produced; turned into a [`DriverSnapshot`] at the end
#[derive(Debug, Default)]
pub(super) struct TickOutcome {
    pub budget: Option<f64>,
    pub dynamic_min_soc: Option<f64>,
    pub decisions: Vec<HysteresisDecision>,
    pub dispatch: Vec<DispatchOutcome>,
    pub schedules: Vec<ChargingSchedule>,
    pub reasons: ReasonCollector,
    pub steps: TickStepDurations,
}

fn elapsed_ms(since: Instant) -> Option<u64> {
    Some(since.elapsed().as_millis() as u64)
}

/// Great-circle distance between two points
pub(crate) fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

async fn until_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Loadpoints eligible for target planning, plus the charging ones that may
/// need a bridge slot
fn collect_plans(
    state: &EngineState,
    now: DateTime<Utc>,
    voltage: f64,
    reasons: &mut ReasonCollector,
) -> (Vec<LoadpointPlan>, Vec<SwitchCandidate>) {
    let mut plans = Vec::new();
    let mut charging = Vec::new();

    for lp in state.loadpoints() {
        let Some(target) = lp.target() else {
            continue;
        };
        if state.charge_mode(target) != Some(ChargeMode::Auto) {
            continue;
        }
        let constraints = state.constraints(&lp);
        let is_charging = state.is_charging(&lp);
        if is_charging && let Some(c) = constraints.as_ref() {
            charging.push(SwitchCandidate {
                loadpoint: target,
                min_power: c.min_power(voltage),
            });
        }

        let Some(car) = lp.car.and_then(|id| state.car(id)) else {
            continue;
        };
        if !state.is_plugged_in(&lp) {
            continue;
        }
        if state.is_away(&lp) {
            reasons.add(target, "Car is away from home");
            continue;
        }
        let Some(pending) = nearest_unfulfilled(&car.targets, now) else {
            continue;
        };
        let Some(soc) = car.soc.get() else {
            reasons.add(target, "SoC unknown, charging target not planned");
            continue;
        };
        let Some(usable_energy_wh) = car.usable_energy_wh else {
            reasons.add(target, "Usable battery energy unknown, charging target not planned");
            continue;
        };
        let Some(constraints) = constraints else {
            reasons.add(target, "Current or phase limits unknown");
            continue;
        };

        plans.push(LoadpointPlan {
            loadpoint: target,
            priority: state.priority(target).unwrap_or(i32::MAX),
            constraints,
            soc_percent: soc,
            usable_energy_wh,
            car_soc_limit: car.soc_limit.get(),
            charging: is_charging,
            target: pending,
        });
    }
    (plans, charging)
}

impl ChargeEngine {
    pub(crate) async fn run_tick(&mut self) {
        let snapshot = self.tick(Utc::now()).await;
        self.logger.debug(&format!(
            "Tick {} done in {:?} ms, budget {:?} W",
            snapshot.total_ticks, snapshot.tick_duration_ms, snapshot.power_budget_w
        ));
    }

    /// Run one control tick at `now` and publish its snapshot.
    ///
    /// A cancelled tick stops between steps; whatever was already written to
    /// the state store stays.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Arc<DriverSnapshot> {
        self.total_ticks += 1;
        let started = Instant::now();
        let logger = get_logger_with_context(LogContext::new("tick").with_tick(self.total_ticks));
        let mut outcome = TickOutcome::default();

        self.control_steps(now, &logger, &mut outcome).await;
        if self.cancel.is_cancelled() {
            logger.warn("Tick cancelled, partial results kept");
        }

        self.publish_snapshot(now, outcome, elapsed_ms(started))
    }

    async fn control_steps(
        &self,
        now: DateTime<Utc>,
        logger: &StructuredLogger,
        outcome: &mut TickOutcome,
    ) {
        let step = Instant::now();
        let Some((forecast, prices)) = until_cancelled(
            &self.cancel,
            self.fetch_inputs(now, logger, &mut outcome.reasons),
        )
        .await
        else {
            return;
        };
        outcome.steps.fetch_inputs_ms = elapsed_ms(step);

        let step = Instant::now();
        self.refresh_geofence();
        outcome.steps.geofence_ms = elapsed_ms(step);

        let step = Instant::now();
        outcome.dynamic_min_soc = self.refresh_battery_minimum(now, &forecast);
        outcome.steps.battery_ms = elapsed_ms(step);

        let step = Instant::now();
        outcome.budget = self.compute_budget(now, outcome.dynamic_min_soc, &mut outcome.reasons);
        outcome.steps.budget_ms = elapsed_ms(step);

        let step = Instant::now();
        outcome.schedules = self.plan_schedules(
            now,
            &forecast,
            prices.as_deref(),
            outcome.dynamic_min_soc,
            logger,
            &mut outcome.reasons,
        );
        outcome.steps.schedule_ms = elapsed_ms(step);
        if self.cancel.is_cancelled() {
            return;
        }

        let step = Instant::now();
        outcome.decisions = self.run_hysteresis(now, outcome.budget, &mut outcome.reasons);
        outcome.steps.hysteresis_ms = elapsed_ms(step);
        if self.cancel.is_cancelled() {
            return;
        }

        let step = Instant::now();
        outcome.dispatch = self
            .dispatcher
            .dispatch_all(
                &self.store,
                &outcome.decisions,
                now,
                &mut outcome.reasons,
                &self.cancel,
            )
            .await;
        outcome.steps.dispatch_ms = elapsed_ms(step);

        let step = Instant::now();
        let fulfilled = self.record_fulfilled_targets(now);
        if fulfilled > 0 {
            logger.info(&format!("{} charging target(s) fulfilled", fulfilled));
        }
        outcome.steps.targets_ms = elapsed_ms(step);
    }

    async fn fetch_inputs(
        &self,
        now: DateTime<Utc>,
        logger: &StructuredLogger,
        reasons: &mut ReasonCollector,
    ) -> (SurplusForecast, Option<Vec<PriceInterval>>) {
        let hour = TimeDelta::hours(1);
        let horizon = TimeDelta::hours(self.config.charging.forecast_horizon_hours);
        let from = now.duration_trunc(hour).unwrap_or(now);

        let forecast = match self
            .forecast
            .predicted_surplus_per_slice(from, now + horizon, hour)
            .await
        {
            Ok(forecast) => forecast,
            Err(e) => {
                logger.warn(&format!("Surplus forecast unavailable: {}", e));
                reasons.add_global("Surplus forecast unavailable");
                SurplusForecast::new()
            }
        };

        let prices = if self.config.charging.use_price_optimization {
            match self.prices.prices(now, now + horizon).await {
                Ok(prices) => Some(prices),
                Err(e) => {
                    logger.warn(&format!("Price curve unavailable: {}", e));
                    reasons.add_global("Price curve unavailable");
                    None
                }
            }
        } else {
            None
        };

        (forecast, prices)
    }

    /// Derive `is_home` from the last known car position. The observation
    /// carries the position's timestamp, so a newer direct report wins.
    fn refresh_geofence(&self) {
        let location = &self.config.location;
        let (Some(latitude), Some(longitude)) = (location.latitude, location.longitude) else {
            return;
        };
        let home = GeoPoint {
            latitude,
            longitude,
        };
        let radius = location.home_radius_m;

        self.store.update(|state| {
            for car in state.cars.values_mut() {
                if let Some(position) = car.location.get() {
                    let at = car.location.timestamp();
                    car.is_home
                        .update(at, Some(distance_m(home, position) <= radius));
                }
            }
        });
    }

    fn refresh_battery_minimum(
        &self,
        now: DateTime<Utc>,
        forecast: &SurplusForecast,
    ) -> Option<f64> {
        let value = self.battery.map(|model| {
            let config = &self.config.home_battery;
            match (
                config.dynamic_min_soc,
                self.config.location.latitude,
                self.config.location.longitude,
            ) {
                (true, Some(lat), Some(lon)) => {
                    let provider = self.forecast.as_ref();
                    let sunrise = next_sun_event(provider, SunEvent::Sunrise, lat, lon, now);
                    let sunset = next_sun_event(provider, SunEvent::Sunset, lat, lon, now);
                    model.dynamic_min_soc_at(
                        forecast,
                        now,
                        sunrise,
                        sunset,
                        config.force_full_by_sunset,
                    )
                }
                _ => model.floor_soc_percent,
            }
        });
        self.store.update(|state| state.dynamic_min_soc = value);
        value
    }

    fn compute_budget(
        &self,
        now: DateTime<Utc>,
        min_soc: Option<f64>,
        reasons: &mut ReasonCollector,
    ) -> Option<f64> {
        let inputs = self.store.read(|state| BudgetInputs {
            sources: state.site.sources(),
            averaged_overage_w: state.site.averaged_overage(now),
            inverter_power_w: state.site.inverter_power.get(),
            current_charging_power_w: state.total_charging_power(),
            power_buffer_w: self.config.control.power_buffer_w,
            home_battery: self.battery.and_then(|model| {
                Some(HomeBatteryInputs {
                    soc_percent: state.site.home_battery_soc.get()?,
                    power_w: state.site.home_battery_power.get()?,
                    min_soc_percent: min_soc.unwrap_or(model.floor_soc_percent),
                    max_charging_power_w: self
                        .config
                        .home_battery
                        .max_charging_power_w
                        .unwrap_or(0.0),
                })
            }),
            max_inverter_ac_power_w: self.config.inverter.max_ac_power_w,
        });
        power_to_control(&inputs, reasons)
    }

    fn plan_schedules(
        &self,
        now: DateTime<Utc>,
        forecast: &SurplusForecast,
        prices: Option<&[PriceInterval]>,
        min_soc: Option<f64>,
        logger: &StructuredLogger,
        reasons: &mut ReasonCollector,
    ) -> Vec<ChargingSchedule> {
        let settings = GeneratorSettings::from_config(&self.config);
        let (plans, charging) = self
            .store
            .read(|state| collect_plans(state, now, settings.nominal_voltage, reasons));

        let battery_soc = self.store.read(|state| state.site.home_battery_soc.get());
        let outlook = self.battery.zip(battery_soc).map(|(model, soc)| BatteryOutlook {
            model,
            soc_percent: soc,
            min_soc_percent: min_soc.unwrap_or(model.floor_soc_percent),
        });

        let mut schedules = generate_schedules(
            now,
            &plans,
            forecast,
            prices,
            outlook.as_ref(),
            &settings,
            reasons,
        );
        let bridge = TimeDelta::minutes(self.config.charging.switch_bridge_minutes);
        for lp in optimize_charging_switch_times(&mut schedules, &charging, now, bridge) {
            logger
                .for_loadpoint(lp)
                .debug("Bridging to the next slot at minimum power");
        }

        self.store.publish_schedules(schedules.clone());
        schedules
    }

    fn run_hysteresis(
        &self,
        now: DateTime<Utc>,
        budget: Option<f64>,
        reasons: &mut ReasonCollector,
    ) -> Vec<HysteresisDecision> {
        let Some(budget) = budget else {
            return Vec::new();
        };
        let settings = HysteresisSettings::from_config(&self.config);
        let elements = self
            .store
            .read(|state| build_elements(state, &settings, now, reasons));
        let decisions = calculate(budget, &elements, &settings);
        self.store
            .update(|state| record_decisions(state, &decisions, now));
        decisions
    }

    /// Mark targets whose occurrence has passed with the SoC reached
    fn record_fulfilled_targets(&self, now: DateTime<Utc>) -> usize {
        self.store.update(|state| {
            let mut fulfilled = 0;
            for car in state.cars.values_mut() {
                let Some(soc) = car.soc.get() else {
                    continue;
                };
                for target in car.targets.iter_mut() {
                    let Some(occurrence) = target.next_occurrence(now) else {
                        continue;
                    };
                    if occurrence <= now
                        && soc >= target.target_soc
                        && !target.is_fulfilled(occurrence)
                    {
                        target.last_fulfilled = Some(now);
                        fulfilled += 1;
                    }
                }
            }
            fulfilled
        })
    }
}
