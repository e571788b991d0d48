//! Final per-loadpoint decisions and delivery to the command sinks
//!
//! Each loadpoint gets exactly one [`DispatchCommand`] per tick. Commands for
//! a car go to the [`CarCommandSink`], commands for a connector to the
//! [`ConnectorCommandSink`]. A failing sink only affects its own loadpoint.

use crate::config::Config;
use crate::error::Result;
use crate::hysteresis::HysteresisDecision;
use crate::loadpoint::{CarId, ChargeMode, ConnectorId, ConstraintValues, Loadpoint, LoadpointRef};
use crate::logging::{StructuredLogger, get_logger};
use crate::reasons::ReasonCollector;
use crate::schedule::{ChargingSchedule, active_at};
use crate::state::{AppliedCommand, EngineState, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DispatchCommand {
    NoOp,
    SetCurrent { current: f64 },
    Start { current: f64, phases: Option<u8> },
    Stop,
}

/// Control channel of cars that manage their own charging
#[async_trait]
pub trait CarCommandSink: Send + Sync {
    async fn start_charging(&self, car: CarId, current: u32) -> Result<()>;
    async fn set_amp(&self, car: CarId, current: u32) -> Result<()>;
    async fn stop_charging(&self, car: CarId) -> Result<()>;
}

/// Control channel of OCPP connectors
#[async_trait]
pub trait ConnectorCommandSink: Send + Sync {
    async fn start_charging(
        &self,
        connector: ConnectorId,
        current: f64,
        phases: Option<u8>,
    ) -> Result<()>;
    async fn set_charging_current(&self, connector: ConnectorId, current: f64) -> Result<()>;
    async fn stop_charging(&self, connector: ConnectorId) -> Result<()>;
}

/// Sink that only logs, for dry runs
pub struct LoggingCarSink {
    logger: StructuredLogger,
}

impl LoggingCarSink {
    pub fn new() -> Self {
        Self {
            logger: get_logger("car_sink"),
        }
    }
}

impl Default for LoggingCarSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CarCommandSink for LoggingCarSink {
    async fn start_charging(&self, car: CarId, current: u32) -> Result<()> {
        self.logger.info(&format!("start {} at {} A", car, current));
        Ok(())
    }

    async fn set_amp(&self, car: CarId, current: u32) -> Result<()> {
        self.logger.info(&format!("set {} to {} A", car, current));
        Ok(())
    }

    async fn stop_charging(&self, car: CarId) -> Result<()> {
        self.logger.info(&format!("stop {}", car));
        Ok(())
    }
}

/// Sink that only logs, for dry runs
pub struct LoggingConnectorSink {
    logger: StructuredLogger,
}

impl LoggingConnectorSink {
    pub fn new() -> Self {
        Self {
            logger: get_logger("connector_sink"),
        }
    }
}

impl Default for LoggingConnectorSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorCommandSink for LoggingConnectorSink {
    async fn start_charging(
        &self,
        connector: ConnectorId,
        current: f64,
        phases: Option<u8>,
    ) -> Result<()> {
        self.logger.info(&format!(
            "start {} at {:.1} A on {:?} phases",
            connector, current, phases
        ));
        Ok(())
    }

    async fn set_charging_current(&self, connector: ConnectorId, current: f64) -> Result<()> {
        self.logger
            .info(&format!("set {} to {:.1} A", connector, current));
        Ok(())
    }

    async fn stop_charging(&self, connector: ConnectorId) -> Result<()> {
        self.logger.info(&format!("stop {}", connector));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
    pub nominal_voltage: f64,
    pub switch_on_delay: TimeDelta,
    pub switch_off_delay: TimeDelta,
    pub current_update_threshold_a: f64,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        let control = &config.control;
        Self {
            nominal_voltage: control.nominal_voltage,
            switch_on_delay: TimeDelta::seconds(control.switch_on_delay_seconds as i64),
            switch_off_delay: TimeDelta::seconds(control.switch_off_delay_seconds as i64),
            current_update_threshold_a: control.current_update_threshold_a,
        }
    }
}

/// What happened to one loadpoint during dispatch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub loadpoint: LoadpointRef,
    pub command: DispatchCommand,
    pub error: Option<String>,
}

/// Power request handed to the current conversion
struct PowerRequest {
    power: f64,
    start: bool,
    stop: bool,
}

fn phases_for(
    constraints: &ConstraintValues,
    recommended: Option<u8>,
    active: Option<u8>,
    power: f64,
    voltage: f64,
) -> u8 {
    if !constraints.can_change_phases {
        return constraints.max_phases;
    }
    let phases = recommended
        .or(active)
        .unwrap_or(constraints.max_phases)
        .clamp(constraints.min_phases, constraints.max_phases);
    // A grid requirement above the one phase range needs all phases
    if phases < constraints.max_phases
        && power > constraints.max_current * voltage * f64::from(phases)
    {
        constraints.max_phases
    } else {
        phases
    }
}

/// Decide the command for `lp` from the current state, the hysteresis
/// decision and the published schedules
pub fn decide(
    state: &EngineState,
    lp: &Loadpoint,
    decision: Option<&HysteresisDecision>,
    schedules: &[ChargingSchedule],
    settings: &DispatchSettings,
    now: DateTime<Utc>,
    reasons: &mut ReasonCollector,
) -> DispatchCommand {
    let Some(target) = lp.target() else {
        return DispatchCommand::NoOp;
    };
    let charging = state.is_charging(lp);

    if !state.is_plugged_in(lp) {
        reasons.add(target, "Not plugged in");
        return DispatchCommand::NoOp;
    }

    let mode = state.charge_mode(target).unwrap_or_default();
    match mode {
        ChargeMode::Off => {
            reasons.add(target, "Charge mode is off");
            return if charging {
                DispatchCommand::Stop
            } else {
                DispatchCommand::NoOp
            };
        }
        ChargeMode::Manual => return DispatchCommand::NoOp,
        _ => {}
    }

    let Some(constraints) = state.constraints(lp) else {
        reasons.add(target, "Current or phase limits unknown");
        return DispatchCommand::NoOp;
    };
    let control = state.control(target);
    let v = settings.nominal_voltage;

    let request = match mode {
        ChargeMode::MaxPower => PowerRequest {
            power: constraints.max_power(v),
            start: true,
            stop: false,
        },
        ChargeMode::PvOnly | ChargeMode::Auto => {
            let required = if mode == ChargeMode::Auto {
                active_at(schedules, target, now)
                    .and_then(|s| s.target_min_power)
                    .unwrap_or(0.0)
            } else {
                0.0
            };
            let Some(decision) = decision else {
                if required <= 0.0 {
                    reasons.add(target, "No surplus decision available");
                    return DispatchCommand::NoOp;
                }
                return command_for(
                    state,
                    lp,
                    &constraints,
                    None,
                    PowerRequest { power: required, start: true, stop: false },
                    charging,
                    settings,
                    reasons,
                );
            };

            let start_held = control.is_some_and(|c| {
                c.should_start.true_for_at_least(now, settings.switch_on_delay)
            });
            let stop_held = control.is_some_and(|c| {
                c.should_stop.true_for_at_least(now, settings.switch_off_delay)
            });

            if !charging && decision.should_start && !start_held && required <= 0.0 {
                reasons.add(target, "Waiting for surplus to hold before starting");
            }
            if charging && decision.should_stop && required > 0.0 {
                reasons.add(target, "Surplus too low, charging from grid to meet target");
            } else if charging && decision.should_stop && !stop_held {
                reasons.add(target, "Surplus too low, stopping after delay");
            }
            if !charging && !decision.should_start && required <= 0.0 {
                reasons.add(
                    target,
                    format!("Surplus of {:.0} W below start threshold", decision.target_power),
                );
            }

            PowerRequest {
                power: decision.allotted_power.max(required),
                start: start_held || required > 0.0,
                stop: stop_held && required <= 0.0,
            }
        }
        ChargeMode::Off | ChargeMode::Manual => return DispatchCommand::NoOp,
    };

    command_for(
        state,
        lp,
        &constraints,
        decision.and_then(|d| d.recommended_phases),
        request,
        charging,
        settings,
        reasons,
    )
}

#[allow(clippy::too_many_arguments)]
fn command_for(
    state: &EngineState,
    lp: &Loadpoint,
    constraints: &ConstraintValues,
    recommended_phases: Option<u8>,
    request: PowerRequest,
    charging: bool,
    settings: &DispatchSettings,
    reasons: &mut ReasonCollector,
) -> DispatchCommand {
    let Some(target) = lp.target() else {
        return DispatchCommand::NoOp;
    };
    let v = settings.nominal_voltage;
    let active = state.active_phases(lp);
    let phases = phases_for(constraints, recommended_phases, active, request.power, v);
    let mut current = (request.power / (v * f64::from(phases)))
        .clamp(constraints.min_current, constraints.max_current);
    if matches!(target, LoadpointRef::Car(_)) {
        // cars take whole amps and never less than their minimum
        current = current.floor().max(constraints.min_current.ceil());
    }
    let phase_arg = constraints.can_change_phases.then_some(phases);

    if !charging {
        return if request.start {
            DispatchCommand::Start { current, phases: phase_arg }
        } else {
            DispatchCommand::NoOp
        };
    }
    if request.stop {
        return DispatchCommand::Stop;
    }

    if constraints.can_change_phases
        && let Some(active) = active
        && active != phases
    {
        reasons.add(target, format!("Switching from {} to {} phases", active, phases));
        return DispatchCommand::Start { current, phases: Some(phases) };
    }

    let last_current = state
        .control(target)
        .and_then(|c| c.last_command)
        .filter(|c| c.running)
        .map(|c| c.current);
    match last_current {
        Some(last) if (current - last).abs() < settings.current_update_threshold_a => {
            DispatchCommand::NoOp
        }
        _ => DispatchCommand::SetCurrent { current },
    }
}

/// Deliver `command` to the sink responsible for `target`
pub async fn apply_command(
    command: DispatchCommand,
    target: LoadpointRef,
    cars: &dyn CarCommandSink,
    connectors: &dyn ConnectorCommandSink,
) -> Result<()> {
    match (target, command) {
        (_, DispatchCommand::NoOp) => Ok(()),
        (LoadpointRef::Car(id), DispatchCommand::Start { current, .. }) => {
            cars.start_charging(id, current.floor() as u32).await
        }
        (LoadpointRef::Car(id), DispatchCommand::SetCurrent { current }) => {
            cars.set_amp(id, current.floor() as u32).await
        }
        (LoadpointRef::Car(id), DispatchCommand::Stop) => cars.stop_charging(id).await,
        (LoadpointRef::Connector(id), DispatchCommand::Start { current, phases }) => {
            connectors.start_charging(id, current, phases).await
        }
        (LoadpointRef::Connector(id), DispatchCommand::SetCurrent { current }) => {
            connectors.set_charging_current(id, current).await
        }
        (LoadpointRef::Connector(id), DispatchCommand::Stop) => connectors.stop_charging(id).await,
    }
}

/// Remember an acknowledged command so the next tick does not wait for
/// telemetry to catch up
pub fn record_applied(
    state: &mut EngineState,
    target: LoadpointRef,
    command: DispatchCommand,
    now: DateTime<Utc>,
) {
    let observed_phases = match target {
        LoadpointRef::Car(id) => state.car(id).and_then(|c| *c.phases.value()),
        LoadpointRef::Connector(id) => state.connector(id).and_then(|c| *c.active_phases.value()),
    };
    let Some(control) = state.control_mut(target) else {
        return;
    };
    let previous_phases = control.last_command.and_then(|c| c.phases).or(observed_phases);
    let applied = match command {
        DispatchCommand::NoOp => return,
        DispatchCommand::Start { current, phases } => AppliedCommand {
            at: now,
            running: true,
            current,
            phases: phases.or(previous_phases),
        },
        DispatchCommand::SetCurrent { current } => AppliedCommand {
            at: now,
            running: true,
            current,
            phases: previous_phases,
        },
        DispatchCommand::Stop => AppliedCommand {
            at: now,
            running: false,
            current: 0.0,
            phases: previous_phases,
        },
    };
    if let DispatchCommand::Start { phases: Some(phases), .. } = command
        && previous_phases.is_some_and(|p| p != phases)
    {
        control.last_phase_switch = Some(now);
    }
    control.last_command = Some(applied);
}

/// Decides and delivers commands for every loadpoint
pub struct Dispatcher {
    cars: Arc<dyn CarCommandSink>,
    connectors: Arc<dyn ConnectorCommandSink>,
    settings: DispatchSettings,
    logger: StructuredLogger,
}

impl Dispatcher {
    pub fn new(
        cars: Arc<dyn CarCommandSink>,
        connectors: Arc<dyn ConnectorCommandSink>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            cars,
            connectors,
            settings,
            logger: get_logger("dispatch"),
        }
    }

    /// Dispatch all loadpoints in order. A cancelled token stops before the
    /// next loadpoint; commands already delivered stay recorded.
    pub async fn dispatch_all(
        &self,
        store: &StateStore,
        decisions: &[HysteresisDecision],
        now: DateTime<Utc>,
        reasons: &mut ReasonCollector,
        cancel: &CancellationToken,
    ) -> Vec<DispatchOutcome> {
        let loadpoints = store.read(EngineState::loadpoints);
        let schedules = store.schedules();
        let mut outcomes = Vec::with_capacity(loadpoints.len());

        for lp in loadpoints {
            if cancel.is_cancelled() {
                self.logger.warn("Dispatch cancelled, remaining loadpoints skipped");
                break;
            }
            let Some(target) = lp.target() else {
                continue;
            };
            let decision = decisions.iter().find(|d| d.loadpoint == target);
            let command = store.read(|state| {
                decide(state, &lp, decision, &schedules, &self.settings, now, reasons)
            });

            let logger = self.logger.for_loadpoint(target);
            let error = match apply_command(command, target, self.cars.as_ref(), self.connectors.as_ref()).await {
                Ok(()) => {
                    if command != DispatchCommand::NoOp {
                        logger.info(&format!("Applied {:?}", command));
                        store.update(|state| record_applied(state, target, command, now));
                    }
                    None
                }
                Err(e) => {
                    logger.error(&format!("Dispatch of {:?} failed: {}", command, e));
                    reasons.add(target, format!("Command failed: {}", e));
                    Some(e.to_string())
                }
            };
            outcomes.push(DispatchOutcome {
                loadpoint: target,
                command,
                error,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CarConfig, ConnectorConfig};
    use crate::error::HelioError;
    use crate::hysteresis::{HysteresisSettings, build_elements, record_decisions};
    use crate::state::{CarObservation, ConnectorObservation};
    use chrono::TimeZone;
    use std::sync::Mutex;

    const WALLBOX: LoadpointRef = LoadpointRef::Connector(ConnectorId(10));
    const CAR: LoadpointRef = LoadpointRef::Car(CarId(1));

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn store(mode: ChargeMode) -> StateStore {
        StateStore::from_config(&config(mode))
    }

    fn config(mode: ChargeMode) -> Config {
        let mut config = Config::default();
        config.connectors.push(ConnectorConfig {
            id: 10,
            name: "garage".to_string(),
            min_current: 6.0,
            max_current: 16.0,
            connected_phases: 3,
            can_switch_phases: false,
            priority: 1,
            charge_mode: mode,
            paired_car_id: None,
        });
        config.cars.push(CarConfig {
            id: 1,
            name: "hatchback".to_string(),
            vin: None,
            usable_energy_kwh: Some(50.0),
            min_current: Some(5.0),
            max_current: Some(16.0),
            max_phases: Some(1),
            priority: 2,
            charge_mode: mode,
            manage_by_car: true,
            charging_targets: Vec::new(),
        });
        config
    }

    fn plug_in(store: &StateStore, charging: bool) {
        let id = ConnectorId(10);
        store
            .observe_connector(id, t(-600), ConnectorObservation::PluggedIn(true))
            .unwrap();
        store
            .observe_connector(id, t(-600), ConnectorObservation::Charging(charging))
            .unwrap();
        store
            .observe_connector(id, t(-600), ConnectorObservation::ActivePhases(3))
            .unwrap();
    }

    fn wallbox() -> Loadpoint {
        Loadpoint {
            car: None,
            connector: Some(ConnectorId(10)),
            manage_by_car: false,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            nominal_voltage: 230.0,
            switch_on_delay: TimeDelta::seconds(60),
            switch_off_delay: TimeDelta::seconds(300),
            current_update_threshold_a: 1.0,
        }
    }

    fn decision(power: f64, start: bool, stop: bool) -> HysteresisDecision {
        HysteresisDecision {
            loadpoint: WALLBOX,
            target_power: power,
            should_start: start,
            should_stop: stop,
            recommended_phases: None,
            allotted_power: if start && !stop { power } else { 0.0 },
        }
    }

    fn hold(store: &StateStore, start: bool, stop: bool, since: DateTime<Utc>) {
        store.update(|state| {
            if let Some(control) = state.control_mut(WALLBOX) {
                control.should_start.update(since, start);
                control.should_stop.update(since, stop);
            }
        });
    }

    #[test]
    fn unplugged_is_a_noop_with_reason() {
        let store = store(ChargeMode::MaxPower);
        let mut reasons = ReasonCollector::new();
        let cmd = store.read(|s| decide(s, &wallbox(), None, &[], &settings(), t(0), &mut reasons));
        assert_eq!(cmd, DispatchCommand::NoOp);
        assert_eq!(reasons.for_loadpoint(WALLBOX), ["Not plugged in".to_string()]);
    }

    #[test]
    fn off_stops_a_charging_loadpoint() {
        let store = store(ChargeMode::Off);
        plug_in(&store, true);
        let mut reasons = ReasonCollector::new();
        let cmd = store.read(|s| decide(s, &wallbox(), None, &[], &settings(), t(0), &mut reasons));
        assert_eq!(cmd, DispatchCommand::Stop);
    }

    #[test]
    fn max_power_starts_at_max_current() {
        let store = store(ChargeMode::MaxPower);
        plug_in(&store, false);
        let mut reasons = ReasonCollector::new();
        let cmd = store.read(|s| decide(s, &wallbox(), None, &[], &settings(), t(0), &mut reasons));
        assert_eq!(cmd, DispatchCommand::Start { current: 16.0, phases: None });
    }

    #[test]
    fn pv_only_start_is_debounced() {
        let store = store(ChargeMode::PvOnly);
        plug_in(&store, false);
        let d = decision(6900.0, true, false);
        let mut reasons = ReasonCollector::new();

        hold(&store, true, false, t(0));
        let early = store.read(|s| decide(s, &wallbox(), Some(&d), &[], &settings(), t(30), &mut reasons));
        assert_eq!(early, DispatchCommand::NoOp);

        let late = store.read(|s| decide(s, &wallbox(), Some(&d), &[], &settings(), t(61), &mut reasons));
        assert_eq!(late, DispatchCommand::Start { current: 10.0, phases: None });
    }

    #[test]
    fn pv_only_stop_waits_for_off_delay() {
        let store = store(ChargeMode::PvOnly);
        plug_in(&store, true);
        let d = decision(500.0, false, true);
        let mut reasons = ReasonCollector::new();

        hold(&store, false, true, t(0));
        let early = store.read(|s| decide(s, &wallbox(), Some(&d), &[], &settings(), t(100), &mut reasons));
        // keeps running at minimum current until the delay has passed
        assert_eq!(early, DispatchCommand::SetCurrent { current: 6.0 });

        let late = store.read(|s| decide(s, &wallbox(), Some(&d), &[], &settings(), t(301), &mut reasons));
        assert_eq!(late, DispatchCommand::Stop);
    }

    #[test]
    fn auto_schedule_requirement_overrides_stop() {
        let store = store(ChargeMode::Auto);
        plug_in(&store, true);
        hold(&store, false, true, t(-1000));
        let schedules = vec![
            ChargingSchedule::new(WALLBOX, t(-60), t(3600), 11_040.0).with_target_min_power(11_040.0),
        ];
        let d = decision(0.0, false, true);
        let mut reasons = ReasonCollector::new();
        let cmd = store.read(|s| {
            decide(s, &wallbox(), Some(&d), &schedules, &settings(), t(0), &mut reasons)
        });
        assert_eq!(cmd, DispatchCommand::SetCurrent { current: 16.0 });
    }

    #[test]
    fn small_current_changes_are_suppressed() {
        let store = store(ChargeMode::MaxPower);
        plug_in(&store, true);
        store.update(|s| {
            record_applied(s, WALLBOX, DispatchCommand::SetCurrent { current: 15.5 }, t(-10))
        });
        let mut reasons = ReasonCollector::new();
        let cmd = store.read(|s| decide(s, &wallbox(), None, &[], &settings(), t(0), &mut reasons));
        assert_eq!(cmd, DispatchCommand::NoOp);
    }

    #[test]
    fn returning_loadpoint_waits_for_a_fresh_start_delay() {
        let store = store(ChargeMode::PvOnly);
        let spike = decision(6900.0, true, false);
        store.update(|s| record_decisions(s, std::slice::from_ref(&spike), t(-3600)));
        // unplugged ticks carry no decision for the wallbox
        store.update(|s| record_decisions(s, &[], t(-3000)));
        plug_in(&store, false);
        store.update(|s| record_decisions(s, std::slice::from_ref(&spike), t(0)));

        let mut reasons = ReasonCollector::new();
        let early =
            store.read(|s| decide(s, &wallbox(), Some(&spike), &[], &settings(), t(1), &mut reasons));
        assert_eq!(early, DispatchCommand::NoOp);
        let late =
            store.read(|s| decide(s, &wallbox(), Some(&spike), &[], &settings(), t(61), &mut reasons));
        assert_eq!(late, DispatchCommand::Start { current: 10.0, phases: None });
    }

    #[test]
    fn phase_switch_restarts_and_starts_the_cooldown() {
        let mut config = config(ChargeMode::PvOnly);
        config.connectors[0].can_switch_phases = true;
        let store = StateStore::from_config(&config);
        plug_in(&store, true);
        let d = HysteresisDecision {
            recommended_phases: Some(1),
            ..decision(2000.0, true, false)
        };
        let mut reasons = ReasonCollector::new();

        let cmd = store.read(|s| decide(s, &wallbox(), Some(&d), &[], &settings(), t(0), &mut reasons));
        let DispatchCommand::Start { current, phases } = cmd else {
            panic!("expected a restart, got {:?}", cmd);
        };
        assert_eq!(phases, Some(1));
        assert!((current - 2000.0 / 230.0).abs() < 1e-9);
        assert_eq!(reasons.for_loadpoint(WALLBOX), ["Switching from 3 to 1 phases".to_string()]);

        store.update(|s| record_applied(s, WALLBOX, cmd, t(0)));
        store.read(|s| {
            let control = s.control(WALLBOX).unwrap();
            assert_eq!(control.last_phase_switch, Some(t(0)));
            assert_eq!(control.last_command.and_then(|c| c.phases), Some(1));
        });

        let hysteresis = HysteresisSettings::from_config(&config);
        let allowed_at = |now: DateTime<Utc>| {
            store.read(|s| {
                build_elements(s, &hysteresis, now, &mut ReasonCollector::new())
                    .iter()
                    .find(|e| e.loadpoint == WALLBOX)
                    .map(|e| e.phase_switch_allowed)
            })
        };
        assert_eq!(allowed_at(t(60)), Some(false));
        assert_eq!(allowed_at(t(0) + hysteresis.phase_switch_cooldown), Some(true));
    }

    #[test]
    fn car_current_is_whole_amps_not_below_its_minimum() {
        let mut config = config(ChargeMode::Auto);
        config.cars[0].min_current = Some(5.5);
        let store = StateStore::from_config(&config);
        store
            .observe_car(CarId(1), t(-600), CarObservation::PluggedIn(true))
            .unwrap();
        let car = Loadpoint {
            car: Some(CarId(1)),
            connector: None,
            manage_by_car: true,
        };
        // 1300 W on one phase is 5.65 A
        let schedules =
            vec![ChargingSchedule::new(CAR, t(-60), t(3600), 1300.0).with_target_min_power(1300.0)];
        let mut reasons = ReasonCollector::new();
        let cmd = store.read(|s| decide(s, &car, None, &schedules, &settings(), t(0), &mut reasons));
        assert_eq!(cmd, DispatchCommand::Start { current: 6.0, phases: None });
    }

    #[derive(Default)]
    struct RecordingCars {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CarCommandSink for RecordingCars {
        async fn start_charging(&self, car: CarId, current: u32) -> Result<()> {
            self.calls.lock().unwrap().push(format!("start {} {}", car, current));
            Ok(())
        }
        async fn set_amp(&self, car: CarId, current: u32) -> Result<()> {
            self.calls.lock().unwrap().push(format!("amp {} {}", car, current));
            Ok(())
        }
        async fn stop_charging(&self, car: CarId) -> Result<()> {
            self.calls.lock().unwrap().push(format!("stop {}", car));
            Ok(())
        }
    }

    struct FailingConnectors;

    #[async_trait]
    impl ConnectorCommandSink for FailingConnectors {
        async fn start_charging(&self, _: ConnectorId, _: f64, _: Option<u8>) -> Result<()> {
            Err(HelioError::dispatch("OCPP not connected"))
        }
        async fn set_charging_current(&self, _: ConnectorId, _: f64) -> Result<()> {
            Err(HelioError::dispatch("OCPP not connected"))
        }
        async fn stop_charging(&self, _: ConnectorId) -> Result<()> {
            Err(HelioError::dispatch("OCPP not connected"))
        }
    }

    #[tokio::test]
    async fn failing_connector_does_not_block_the_car() {
        let store = store(ChargeMode::MaxPower);
        plug_in(&store, false);
        store
            .observe_car(CarId(1), t(-600), CarObservation::PluggedIn(true))
            .unwrap();

        let cars = Arc::new(RecordingCars::default());
        let dispatcher = Dispatcher::new(cars.clone(), Arc::new(FailingConnectors), settings());
        let mut reasons = ReasonCollector::new();
        let outcomes = dispatcher
            .dispatch_all(&store, &[], t(0), &mut reasons, &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 2);
        let wallbox = outcomes.iter().find(|o| o.loadpoint == WALLBOX).unwrap();
        assert!(wallbox.error.is_some());
        assert!(reasons.for_loadpoint(WALLBOX)[0].starts_with("Command failed"));
        assert_eq!(cars.calls.lock().unwrap().as_slice(), ["start car#1 16".to_string()]);
        // acknowledged commands count as charging, failed ones do not
        store.read(|s| {
            assert!(s.control(CAR).and_then(|c| c.last_command).is_some_and(|c| c.running));
            assert!(s.control(WALLBOX).and_then(|c| c.last_command).is_none());
        });
    }

    #[tokio::test]
    async fn cancelled_token_skips_everything() {
        let store = store(ChargeMode::MaxPower);
        plug_in(&store, false);
        let dispatcher = Dispatcher::new(
            Arc::new(LoggingCarSink::new()),
            Arc::new(LoggingConnectorSink::new()),
            settings(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reasons = ReasonCollector::new();
        let outcomes = dispatcher.dispatch_all(&store, &[], t(0), &mut reasons, &cancel).await;
        assert!(outcomes.is_empty());
    }
}
