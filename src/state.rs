//! Process-wide engine state
//!
//! Ingestion collaborators (MQTT, OCPP telemetry, vehicle cloud polling) and
//! the control tick share one [`StateStore`]. All external signals go through
//! [`StateStore::observe_car`], [`StateStore::observe_connector`] and
//! [`StateStore::observe_site`], which apply the stale-timestamp rule of
//! [`Timestamped`] under a single lock. The published schedule set is swapped
//! as a whole, so readers never see a half-written set.

use crate::config::Config;
use crate::error::{HelioError, Result};
use crate::loadpoint::{
    AvailablePowerSources, CarId, CarLimits, ChargeMode, ConnectorId, ConnectorLimits,
    ConstraintValues, Loadpoint, LoadpointRef,
};
use crate::observation::Timestamped;
use crate::schedule::ChargingSchedule;
use crate::targets::ChargingTarget;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// WGS84 position
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Last command a sink acknowledged for a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AppliedCommand {
    pub at: DateTime<Utc>,
    pub running: bool,
    pub current: f64,
    pub phases: Option<u8>,
}

/// Decisions of the hysteresis step and the dispatch bookkeeping of a device
#[derive(Debug, Clone, Serialize)]
pub struct ControlState {
    pub should_start: Timestamped<bool>,
    pub should_stop: Timestamped<bool>,
    pub recommended_phases: Timestamped<Option<u8>>,
    pub last_command: Option<AppliedCommand>,
    pub last_phase_switch: Option<DateTime<Utc>>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            should_start: Timestamped::unset(),
            should_stop: Timestamped::unset(),
            recommended_phases: Timestamped::unknown(),
            last_command: None,
            last_phase_switch: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CarState {
    pub id: CarId,
    pub name: String,
    pub vin: Option<String>,
    pub usable_energy_wh: Option<f64>,
    pub min_current: Option<f64>,
    pub max_current: Option<f64>,
    pub max_phases: Option<u8>,
    pub priority: i32,
    pub charge_mode: ChargeMode,
    pub manage_by_car: bool,
    pub targets: Vec<ChargingTarget>,
    pub soc: Timestamped<Option<f64>>,
    /// Charge limit configured in the car itself
    pub soc_limit: Timestamped<Option<f64>>,
    pub plugged_in: Timestamped<Option<bool>>,
    pub charging: Timestamped<Option<bool>>,
    pub charging_power: Timestamped<Option<f64>>,
    pub phases: Timestamped<Option<u8>>,
    pub location: Timestamped<Option<GeoPoint>>,
    pub is_home: Timestamped<Option<bool>>,
    pub control: ControlState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorState {
    pub id: ConnectorId,
    pub name: String,
    pub min_current: f64,
    pub max_current: f64,
    pub connected_phases: u8,
    pub can_switch_phases: bool,
    pub priority: i32,
    pub charge_mode: ChargeMode,
    pub paired_car_id: Option<CarId>,
    /// Car identified on the connector by the charging session
    pub connected_car: Timestamped<Option<CarId>>,
    pub plugged_in: Timestamped<Option<bool>>,
    pub charging: Timestamped<Option<bool>>,
    pub charging_power: Timestamped<Option<f64>>,
    pub active_phases: Timestamped<Option<u8>>,
    pub control: ControlState,
}

/// Site meter readings
#[derive(Debug, Clone, Serialize)]
pub struct SiteState {
    /// Grid export in watts, negative while importing
    pub grid_overage: Timestamped<Option<f64>>,
    pub inverter_power: Timestamped<Option<f64>>,
    pub home_battery_soc: Timestamped<Option<f64>>,
    /// Positive while the battery charges
    pub home_battery_power: Timestamped<Option<f64>>,
    #[serde(skip)]
    overage_samples: VecDeque<(DateTime<Utc>, f64)>,
    #[serde(skip)]
    overage_window: TimeDelta,
}

impl SiteState {
    fn new(overage_window: TimeDelta) -> Self {
        Self {
            grid_overage: Timestamped::unknown(),
            inverter_power: Timestamped::unknown(),
            home_battery_soc: Timestamped::unknown(),
            home_battery_power: Timestamped::unknown(),
            overage_samples: VecDeque::new(),
            overage_window,
        }
    }

    /// Mean of the overage samples inside the averaging window ending at
    /// `now`, or the latest reading when the window holds no samples
    pub fn averaged_overage(&self, now: DateTime<Utc>) -> Option<f64> {
        let since = now - self.overage_window;
        let recent: Vec<f64> = self
            .overage_samples
            .iter()
            .filter(|(at, _)| *at >= since && *at <= now)
            .map(|(_, watts)| *watts)
            .collect();
        if recent.is_empty() {
            return *self.grid_overage.value();
        }
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    pub fn sources(&self) -> AvailablePowerSources {
        AvailablePowerSources {
            grid_power_available: self.grid_overage.value().is_some(),
            inverter_power_available: self.inverter_power.value().is_some(),
            home_battery_power_available: self.home_battery_power.value().is_some()
                && self.home_battery_soc.value().is_some(),
        }
    }

    fn push_overage(&mut self, at: DateTime<Utc>, watts: f64) {
        self.overage_samples.push_back((at, watts));
        let keep_after = at - self.overage_window;
        while self
            .overage_samples
            .front()
            .is_some_and(|(t, _)| *t < keep_after)
        {
            self.overage_samples.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CarObservation {
    Soc(f64),
    SocLimit(f64),
    PluggedIn(bool),
    Charging(bool),
    ChargingPower(f64),
    Phases(u8),
    Location(GeoPoint),
    IsHome(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectorObservation {
    ConnectedCar(Option<CarId>),
    PluggedIn(bool),
    Charging(bool),
    ChargingPower(f64),
    ActivePhases(u8),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SiteObservation {
    GridOverage(f64),
    InverterPower(f64),
    HomeBatterySoc(f64),
    HomeBatteryPower(f64),
}

/// Everything the control tick reads and writes
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub cars: BTreeMap<CarId, CarState>,
    pub connectors: BTreeMap<ConnectorId, ConnectorState>,
    pub site: SiteState,
    pub dynamic_min_soc: Option<f64>,
    #[serde(skip)]
    schedules: Arc<Vec<ChargingSchedule>>,
}

impl EngineState {
    pub fn from_config(config: &Config) -> Self {
        let cars = config
            .cars
            .iter()
            .map(|c| {
                let id = CarId(c.id);
                let state = CarState {
                    id,
                    name: c.name.clone(),
                    vin: c.vin.clone(),
                    usable_energy_wh: c.usable_energy_kwh.map(|kwh| kwh * 1000.0),
                    min_current: c.min_current,
                    max_current: c.max_current,
                    max_phases: c.max_phases,
                    priority: c.priority,
                    charge_mode: c.charge_mode,
                    manage_by_car: c.manage_by_car,
                    targets: c
                        .charging_targets
                        .iter()
                        .map(|t| t.in_site_zone(&config.timezone))
                        .collect(),
                    soc: Timestamped::unknown(),
                    soc_limit: Timestamped::unknown(),
                    plugged_in: Timestamped::unknown(),
                    charging: Timestamped::unknown(),
                    charging_power: Timestamped::unknown(),
                    phases: Timestamped::unknown(),
                    location: Timestamped::unknown(),
                    is_home: Timestamped::unknown(),
                    control: ControlState::default(),
                };
                (id, state)
            })
            .collect();

        let connectors = config
            .connectors
            .iter()
            .map(|c| {
                let id = ConnectorId(c.id);
                let state = ConnectorState {
                    id,
                    name: c.name.clone(),
                    min_current: c.min_current,
                    max_current: c.max_current,
                    connected_phases: c.connected_phases,
                    can_switch_phases: c.can_switch_phases,
                    priority: c.priority,
                    charge_mode: c.charge_mode,
                    paired_car_id: c.paired_car_id.map(CarId),
                    connected_car: Timestamped::unknown(),
                    plugged_in: Timestamped::unknown(),
                    charging: Timestamped::unknown(),
                    charging_power: Timestamped::unknown(),
                    active_phases: Timestamped::unknown(),
                    control: ControlState::default(),
                };
                (id, state)
            })
            .collect();

        let window = TimeDelta::seconds(config.control.overage_average_seconds as i64);
        Self {
            cars,
            connectors,
            site: SiteState::new(window),
            dynamic_min_soc: None,
            schedules: Arc::new(Vec::new()),
        }
    }

    pub fn schedules(&self) -> Arc<Vec<ChargingSchedule>> {
        Arc::clone(&self.schedules)
    }

    /// Enumerate loadpoints. A car identified on (or paired with) a connector
    /// forms one loadpoint with it; the remaining cars stand alone.
    pub fn loadpoints(&self) -> Vec<Loadpoint> {
        let mut attached = HashSet::new();
        let mut out = Vec::new();
        for connector in self.connectors.values() {
            let car = connector
                .connected_car
                .get()
                .or(connector.paired_car_id)
                .filter(|id| self.cars.contains_key(id) && !attached.contains(id));
            if let Some(id) = car {
                attached.insert(id);
            }
            out.push(Loadpoint {
                car,
                connector: Some(connector.id),
                manage_by_car: car
                    .and_then(|id| self.cars.get(&id))
                    .is_some_and(|c| c.manage_by_car),
            });
        }
        for car in self.cars.values() {
            if !attached.contains(&car.id) {
                out.push(Loadpoint {
                    car: Some(car.id),
                    connector: None,
                    manage_by_car: true,
                });
            }
        }
        out
    }

    pub fn car(&self, id: CarId) -> Option<&CarState> {
        self.cars.get(&id)
    }

    pub fn connector(&self, id: ConnectorId) -> Option<&ConnectorState> {
        self.connectors.get(&id)
    }

    pub fn charge_mode(&self, target: LoadpointRef) -> Option<ChargeMode> {
        match target {
            LoadpointRef::Car(id) => self.cars.get(&id).map(|c| c.charge_mode),
            LoadpointRef::Connector(id) => self.connectors.get(&id).map(|c| c.charge_mode),
        }
    }

    pub fn priority(&self, target: LoadpointRef) -> Option<i32> {
        match target {
            LoadpointRef::Car(id) => self.cars.get(&id).map(|c| c.priority),
            LoadpointRef::Connector(id) => self.connectors.get(&id).map(|c| c.priority),
        }
    }

    pub fn control(&self, target: LoadpointRef) -> Option<&ControlState> {
        match target {
            LoadpointRef::Car(id) => self.cars.get(&id).map(|c| &c.control),
            LoadpointRef::Connector(id) => self.connectors.get(&id).map(|c| &c.control),
        }
    }

    pub fn control_mut(&mut self, target: LoadpointRef) -> Option<&mut ControlState> {
        match target {
            LoadpointRef::Car(id) => self.cars.get_mut(&id).map(|c| &mut c.control),
            LoadpointRef::Connector(id) => self.connectors.get_mut(&id).map(|c| &mut c.control),
        }
    }

    /// Resolved limits for this tick, `None` when a bound is unknown
    pub fn constraints(&self, lp: &Loadpoint) -> Option<ConstraintValues> {
        let target = lp.target()?;
        let car = lp.car.and_then(|id| self.cars.get(&id));
        let connector = lp.connector.and_then(|id| self.connectors.get(&id));

        let car_limits = car.map(|c| CarLimits {
            min_current: c.min_current,
            max_current: c.max_current,
            max_phases: c.max_phases,
            soc_limit: *c.soc_limit.value(),
        });
        // The wallbox limits a car even when the car takes the commands, but
        // only the wallbox can switch phases
        let connector_switches = matches!(target, LoadpointRef::Connector(_));
        let connector_limits = connector.map(|c| {
            let can_switch_phases = c.can_switch_phases && connector_switches;
            ConnectorLimits {
                min_current: Some(c.min_current),
                max_current: Some(c.max_current),
                min_phases: Some(if can_switch_phases { 1 } else { c.connected_phases }),
                max_phases: Some(c.connected_phases),
                can_switch_phases,
            }
        });

        ConstraintValues::resolve(
            car_limits.as_ref(),
            connector_limits.as_ref(),
            self.charge_mode(target)?,
        )
    }

    pub fn is_plugged_in(&self, lp: &Loadpoint) -> bool {
        let connector = lp
            .connector
            .and_then(|id| self.connectors.get(&id))
            .and_then(|c| *c.plugged_in.value());
        let car = lp
            .car
            .and_then(|id| self.cars.get(&id))
            .and_then(|c| *c.plugged_in.value());
        connector.or(car).unwrap_or(false)
    }

    /// The car is away when its geofence says so; unknown counts as home
    pub fn is_away(&self, lp: &Loadpoint) -> bool {
        lp.car
            .and_then(|id| self.cars.get(&id))
            .is_some_and(|c| *c.is_home.value() == Some(false))
    }

    /// Observed charging flag of the commanded device, overridden by a newer
    /// acknowledged command
    pub fn is_charging(&self, lp: &Loadpoint) -> bool {
        let Some(target) = lp.target() else {
            return false;
        };
        let observed = match target {
            LoadpointRef::Car(id) => self.cars.get(&id).map(|c| &c.charging),
            LoadpointRef::Connector(id) => self.connectors.get(&id).map(|c| &c.charging),
        };
        let command = self.control(target).and_then(|c| c.last_command);
        match (observed, command) {
            (Some(obs), Some(cmd)) if cmd.at > obs.timestamp() => cmd.running,
            (Some(obs), _) => obs.get().unwrap_or(false),
            (None, Some(cmd)) => cmd.running,
            (None, None) => false,
        }
    }

    pub fn charging_power(&self, lp: &Loadpoint) -> f64 {
        let connector = lp
            .connector
            .and_then(|id| self.connectors.get(&id))
            .and_then(|c| *c.charging_power.value());
        let car = lp
            .car
            .and_then(|id| self.cars.get(&id))
            .and_then(|c| *c.charging_power.value());
        match lp.target() {
            Some(LoadpointRef::Car(_)) => car.or(connector),
            _ => connector.or(car),
        }
        .unwrap_or(0.0)
        .max(0.0)
    }

    pub fn active_phases(&self, lp: &Loadpoint) -> Option<u8> {
        let connector = lp
            .connector
            .and_then(|id| self.connectors.get(&id))
            .and_then(|c| *c.active_phases.value());
        let car = lp
            .car
            .and_then(|id| self.cars.get(&id))
            .and_then(|c| *c.phases.value());
        connector.or(car)
    }

    pub fn total_charging_power(&self) -> f64 {
        self.loadpoints()
            .iter()
            .map(|lp| self.charging_power(lp))
            .sum()
    }

    fn observe_car(&mut self, id: CarId, at: DateTime<Utc>, obs: CarObservation) -> Result<bool> {
        let car = self
            .cars
            .get_mut(&id)
            .ok_or_else(|| HelioError::missing_data(format!("unknown {}", id)))?;
        Ok(match obs {
            CarObservation::Soc(v) => car.soc.update(at, Some(v)),
            CarObservation::SocLimit(v) => car.soc_limit.update(at, Some(v)),
            CarObservation::PluggedIn(v) => car.plugged_in.update(at, Some(v)),
            CarObservation::Charging(v) => car.charging.update(at, Some(v)),
            CarObservation::ChargingPower(v) => car.charging_power.update(at, Some(v)),
            CarObservation::Phases(v) => car.phases.update(at, Some(v)),
            CarObservation::Location(v) => car.location.update(at, Some(v)),
            CarObservation::IsHome(v) => car.is_home.update(at, Some(v)),
        })
    }

    fn observe_connector(
        &mut self,
        id: ConnectorId,
        at: DateTime<Utc>,
        obs: ConnectorObservation,
    ) -> Result<bool> {
        let connector = self
            .connectors
            .get_mut(&id)
            .ok_or_else(|| HelioError::missing_data(format!("unknown {}", id)))?;
        Ok(match obs {
            ConnectorObservation::ConnectedCar(v) => connector.connected_car.update(at, v),
            ConnectorObservation::PluggedIn(v) => connector.plugged_in.update(at, Some(v)),
            ConnectorObservation::Charging(v) => connector.charging.update(at, Some(v)),
            ConnectorObservation::ChargingPower(v) => connector.charging_power.update(at, Some(v)),
            ConnectorObservation::ActivePhases(v) => connector.active_phases.update(at, Some(v)),
        })
    }

    fn observe_site(&mut self, at: DateTime<Utc>, obs: SiteObservation) -> bool {
        let site = &mut self.site;
        match obs {
            SiteObservation::GridOverage(v) => {
                let accepted = site.grid_overage.update(at, Some(v));
                if accepted {
                    site.push_overage(at, v);
                }
                accepted
            }
            SiteObservation::InverterPower(v) => site.inverter_power.update(at, Some(v)),
            SiteObservation::HomeBatterySoc(v) => site.home_battery_soc.update(at, Some(v)),
            SiteObservation::HomeBatteryPower(v) => site.home_battery_power.update(at, Some(v)),
        }
    }
}

/// Shared handle to the engine state
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Mutex<EngineState>>,
}

impl StateStore {
    pub fn new(state: EngineState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(EngineState::from_config(config))
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // The state stays usable after a panicking writer
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a car observation; `Ok(false)` when it was stale
    pub fn observe_car(&self, id: CarId, at: DateTime<Utc>, obs: CarObservation) -> Result<bool> {
        self.lock().observe_car(id, at, obs)
    }

    /// Record a connector observation; `Ok(false)` when it was stale
    pub fn observe_connector(
        &self,
        id: ConnectorId,
        at: DateTime<Utc>,
        obs: ConnectorObservation,
    ) -> Result<bool> {
        self.lock().observe_connector(id, at, obs)
    }

    /// Record a site meter observation; `false` when it was stale
    pub fn observe_site(&self, at: DateTime<Utc>, obs: SiteObservation) -> bool {
        self.lock().observe_site(at, obs)
    }

    pub fn read<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(&self.lock())
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Point-in-time copy for readers
    pub fn snapshot(&self) -> EngineState {
        self.lock().clone()
    }

    pub fn schedules(&self) -> Arc<Vec<ChargingSchedule>> {
        self.lock().schedules()
    }

    /// Replace the published schedule set in one step
    pub fn publish_schedules(&self, schedules: Vec<ChargingSchedule>) {
        self.lock().schedules = Arc::new(schedules);
    }

    pub fn set_charge_mode(&self, target: LoadpointRef, mode: ChargeMode) -> Result<()> {
        let mut state = self.lock();
        let slot = match target {
            LoadpointRef::Car(id) => state.cars.get_mut(&id).map(|c| &mut c.charge_mode),
            LoadpointRef::Connector(id) => {
                state.connectors.get_mut(&id).map(|c| &mut c.charge_mode)
            }
        };
        let slot = slot.ok_or_else(|| HelioError::missing_data(format!("unknown {}", target)))?;
        *slot = mode;
        Ok(())
    }

    pub fn set_priority(&self, target: LoadpointRef, priority: i32) -> Result<()> {
        let mut state = self.lock();
        let slot = match target {
            LoadpointRef::Car(id) => state.cars.get_mut(&id).map(|c| &mut c.priority),
            LoadpointRef::Connector(id) => {
                state.connectors.get_mut(&id).map(|c| &mut c.priority)
            }
        };
        let slot = slot.ok_or_else(|| HelioError::missing_data(format!("unknown {}", target)))?;
        *slot = priority;
        Ok(())
    }
}
