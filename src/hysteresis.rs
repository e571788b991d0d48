//! Start/stop hysteresis
//!
//! Distributes the power budget over surplus-driven loadpoints in priority
//! order and decides per loadpoint whether it should start, keep running or
//! stop, and which phase count it should run on. Decisions are stored as
//! [`crate::observation::Timestamped`] values so dispatch can require them
//! to hold for a while before acting.

use crate::config::Config;
use crate::loadpoint::{CarId, ChargeMode, ConnectorId, LoadpointRef};
use crate::reasons::ReasonCollector;
use crate::state::EngineState;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisSettings {
    pub nominal_voltage: f64,
    pub switch_on_offset_w: f64,
    pub switch_off_offset_w: f64,
    pub phase_hysteresis_w: f64,
    pub phase_switch_cooldown: TimeDelta,
}

impl HysteresisSettings {
    pub fn from_config(config: &Config) -> Self {
        let control = &config.control;
        Self {
            nominal_voltage: control.nominal_voltage,
            switch_on_offset_w: control.switch_on_offset_w,
            switch_off_offset_w: control.switch_off_offset_w,
            phase_hysteresis_w: control.phase_hysteresis_w,
            phase_switch_cooldown: TimeDelta::seconds(control.phase_switch_cooldown_seconds as i64),
        }
    }
}

/// Power window per phase count of a device that can switch phases
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseThresholds {
    pub min_one_phase: f64,
    pub max_one_phase: f64,
    pub min_multi_phase: f64,
    pub max_multi_phase: f64,
    pub multi_phases: u8,
}

impl PhaseThresholds {
    fn window(&self, phases: u8) -> (f64, f64) {
        if phases <= 1 {
            (self.min_one_phase, self.max_one_phase)
        } else {
            (self.min_multi_phase, self.max_multi_phase)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HysteresisElement {
    pub loadpoint: LoadpointRef,
    pub car: Option<CarId>,
    pub connector: Option<ConnectorId>,
    pub priority: i32,
    pub switch_on_at_power: f64,
    pub switch_off_at_power: f64,
    pub current_power: f64,
    pub min_power: f64,
    pub max_power: f64,
    /// Only present when the device can switch phases and its active phase
    /// count is known
    pub phases: Option<PhaseThresholds>,
    pub active_phases: Option<u8>,
    pub phase_switch_allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HysteresisDecision {
    pub loadpoint: LoadpointRef,
    pub target_power: f64,
    pub should_start: bool,
    pub should_stop: bool,
    pub recommended_phases: Option<u8>,
    /// Power this loadpoint keeps from the pool
    pub allotted_power: f64,
}

fn follows_surplus(mode: ChargeMode) -> bool {
    matches!(mode, ChargeMode::PvOnly | ChargeMode::Auto)
}

/// One element per plugged-in, surplus-driven loadpoint with known limits
pub fn build_elements(
    state: &EngineState,
    settings: &HysteresisSettings,
    now: DateTime<Utc>,
    reasons: &mut ReasonCollector,
) -> Vec<HysteresisElement> {
    let v = settings.nominal_voltage;
    let mut elements = Vec::new();

    for lp in state.loadpoints() {
        let Some(target) = lp.target() else {
            continue;
        };
        if !state.is_plugged_in(&lp) || !state.charge_mode(target).is_some_and(follows_surplus) {
            continue;
        }
        let Some(constraints) = state.constraints(&lp) else {
            reasons.add(target, "Current or phase limits unknown");
            continue;
        };

        let active_phases = state.active_phases(&lp);
        let phases = (constraints.can_change_phases && active_phases.is_some()).then(|| {
            PhaseThresholds {
                min_one_phase: constraints.min_current * v,
                max_one_phase: constraints.max_current * v,
                min_multi_phase: constraints.min_current * v * f64::from(constraints.max_phases),
                max_multi_phase: constraints.max_current * v * f64::from(constraints.max_phases),
                multi_phases: constraints.max_phases,
            }
        });
        let phase_switch_allowed = state
            .control(target)
            .and_then(|c| c.last_phase_switch)
            .is_none_or(|at| now - at >= settings.phase_switch_cooldown);

        let min_power = constraints.min_power(v);
        elements.push(HysteresisElement {
            loadpoint: target,
            car: lp.car,
            connector: lp.connector,
            priority: state.priority(target).unwrap_or(i32::MAX),
            switch_on_at_power: min_power + settings.switch_on_offset_w,
            switch_off_at_power: min_power - settings.switch_off_offset_w,
            current_power: state.charging_power(&lp),
            min_power,
            max_power: constraints.max_power(v),
            phases,
            active_phases,
            phase_switch_allowed,
        });
    }
    elements
}

fn recommend_phases(
    element: &HysteresisElement,
    thresholds: &PhaseThresholds,
    target_power: f64,
    hysteresis: f64,
) -> Option<u8> {
    let active = element.active_phases?;
    if !element.phase_switch_allowed {
        return Some(active);
    }
    if active <= 1 {
        if target_power >= thresholds.min_multi_phase + hysteresis {
            return Some(thresholds.multi_phases);
        }
    } else if target_power < thresholds.max_one_phase.min(thresholds.min_multi_phase) - hysteresis {
        return Some(1);
    }
    Some(active)
}

/// Walk `elements` by priority, lowest number first.
///
/// The pool starts at `budget` plus the power the participants draw now, so
/// each loadpoint competes for its own consumption and whatever higher
/// priorities leave over. Loadpoints sharing a car or connector with an
/// earlier element are skipped.
pub fn calculate(
    budget: f64,
    elements: &[HysteresisElement],
    settings: &HysteresisSettings,
) -> Vec<HysteresisDecision> {
    let mut ordered: Vec<&HysteresisElement> = elements.iter().collect();
    ordered.sort_by_key(|e| e.priority);

    let mut seen_cars = HashSet::new();
    let mut seen_connectors = HashSet::new();
    let mut participants = Vec::new();
    for element in ordered {
        let car_seen = element.car.is_some_and(|id| !seen_cars.insert(id));
        let connector_seen = element.connector.is_some_and(|id| !seen_connectors.insert(id));
        if !car_seen && !connector_seen {
            participants.push(element);
        }
    }

    let mut pool = budget + participants.iter().map(|e| e.current_power).sum::<f64>();
    let mut decisions = Vec::with_capacity(participants.len());

    for element in participants {
        let target_power = pool;
        let should_start = element.switch_on_at_power < target_power;
        let should_stop = element.switch_off_at_power > target_power;

        let recommended_phases = element.phases.as_ref().and_then(|t| {
            recommend_phases(element, t, target_power, settings.phase_hysteresis_w)
        });
        let (min, max) = match (element.phases.as_ref(), recommended_phases) {
            (Some(t), Some(phases)) => t.window(phases),
            _ => (element.min_power, element.max_power),
        };

        let keeps_running = if element.current_power > 0.0 {
            !should_stop
        } else {
            should_start
        };
        let allotted_power = if keeps_running {
            target_power.clamp(min, max.max(min))
        } else {
            0.0
        };
        pool -= allotted_power;

        decisions.push(HysteresisDecision {
            loadpoint: element.loadpoint,
            target_power,
            should_start,
            should_stop,
            recommended_phases,
            allotted_power,
        });
    }
    decisions
}

/// Store decisions on the devices they were made for.
///
/// Devices without a decision this tick have their start and stop conditions
/// cleared, so a loadpoint coming back starts its debounce from scratch.
pub fn record_decisions(
    state: &mut EngineState,
    decisions: &[HysteresisDecision],
    now: DateTime<Utc>,
) {
    for decision in decisions {
        if let Some(control) = state.control_mut(decision.loadpoint) {
            control.should_start.update(now, decision.should_start);
            control.should_stop.update(now, decision.should_stop);
            control
                .recommended_phases
                .update(now, decision.recommended_phases);
        }
    }

    let decided: HashSet<LoadpointRef> = decisions.iter().map(|d| d.loadpoint).collect();
    let idle = state
        .cars
        .values_mut()
        .filter(|c| !decided.contains(&LoadpointRef::Car(c.id)))
        .map(|c| &mut c.control)
        .chain(
            state
                .connectors
                .values_mut()
                .filter(|c| !decided.contains(&LoadpointRef::Connector(c.id)))
                .map(|c| &mut c.control),
        );
    for control in idle {
        control.should_start.update(now, false);
        control.should_stop.update(now, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> HysteresisSettings {
        HysteresisSettings {
            nominal_voltage: 230.0,
            switch_on_offset_w: 200.0,
            switch_off_offset_w: 200.0,
            phase_hysteresis_w: 300.0,
            phase_switch_cooldown: TimeDelta::minutes(10),
        }
    }

    fn element(id: u32, priority: i32, current_power: f64) -> HysteresisElement {
        HysteresisElement {
            loadpoint: LoadpointRef::Car(CarId(id)),
            car: Some(CarId(id)),
            connector: None,
            priority,
            switch_on_at_power: 4340.0,
            switch_off_at_power: 3940.0,
            current_power,
            min_power: 4140.0,
            max_power: 11_040.0,
            phases: None,
            active_phases: Some(3),
            phase_switch_allowed: true,
        }
    }

    fn switchable(active: u8, allowed: bool) -> HysteresisElement {
        HysteresisElement {
            loadpoint: LoadpointRef::Connector(ConnectorId(1)),
            car: None,
            connector: Some(ConnectorId(1)),
            min_power: 1380.0,
            switch_on_at_power: 1580.0,
            switch_off_at_power: 1180.0,
            phases: Some(PhaseThresholds {
                min_one_phase: 1380.0,
                max_one_phase: 3680.0,
                min_multi_phase: 4140.0,
                max_multi_phase: 11_040.0,
                multi_phases: 3,
            }),
            active_phases: Some(active),
            phase_switch_allowed: allowed,
            current_power: 0.0,
            ..element(1, 1, 0.0)
        }
    }

    #[test]
    fn deficit_stops_the_lower_priority_first() {
        let elements = vec![element(2, 2, 4000.0), element(1, 1, 4000.0)];
        let decisions = calculate(-2000.0, &elements, &settings());

        assert_eq!(decisions[0].loadpoint, LoadpointRef::Car(CarId(1)));
        assert!(!decisions[0].should_stop);
        assert_eq!(decisions[0].allotted_power, 6000.0);

        assert_eq!(decisions[1].loadpoint, LoadpointRef::Car(CarId(2)));
        assert!(decisions[1].should_stop);
        assert_eq!(decisions[1].allotted_power, 0.0);
    }

    #[test]
    fn idle_loadpoint_starts_above_switch_on_threshold() {
        let decisions = calculate(4500.0, &[element(1, 1, 0.0)], &settings());
        assert!(decisions[0].should_start);
        let decisions = calculate(4300.0, &[element(1, 1, 0.0)], &settings());
        assert!(!decisions[0].should_start);
        assert_eq!(decisions[0].allotted_power, 0.0);
    }

    #[test]
    fn shared_devices_are_evaluated_once() {
        let mut twin = element(1, 2, 4000.0);
        twin.loadpoint = LoadpointRef::Connector(ConnectorId(9));
        let decisions = calculate(0.0, &[element(1, 1, 4000.0), twin], &settings());
        assert_eq!(decisions.len(), 1);
    }

    #[test]
    fn phase_switching_uses_active_count_as_center() {
        let s = settings();
        // on one phase: need 4140 + 300 before going to three
        let up = calculate(4300.0, &[switchable(1, true)], &s);
        assert_eq!(up[0].recommended_phases, Some(1));
        let up = calculate(4500.0, &[switchable(1, true)], &s);
        assert_eq!(up[0].recommended_phases, Some(3));

        // on three phases: stay until below 3680 - 300
        let down = calculate(3500.0, &[switchable(3, true)], &s);
        assert_eq!(down[0].recommended_phases, Some(3));
        let down = calculate(3300.0, &[switchable(3, true)], &s);
        assert_eq!(down[0].recommended_phases, Some(1));
        assert_eq!(down[0].allotted_power, 3300.0);
    }

    #[test]
    fn cooldown_keeps_current_phases() {
        let decisions = calculate(9000.0, &[switchable(1, false)], &settings());
        assert_eq!(decisions[0].recommended_phases, Some(1));
    }
}
