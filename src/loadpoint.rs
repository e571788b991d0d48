//! Loadpoint identity and per-tick constraint resolution
//!
//! A loadpoint is either a car controlled through its own charge controller,
//! an OCPP connector controlled through the wallbox, or a car plugged into a
//! connector. [`LoadpointRef`] names the device that actually receives the
//! commands for a loadpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal car identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CarId(pub u32);

/// Internal OCPP connector identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(pub u32);

impl fmt::Display for CarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "car#{}", self.0)
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector#{}", self.0)
    }
}

/// The device that is commanded for a loadpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LoadpointRef {
    Car(CarId),
    Connector(ConnectorId),
}

impl fmt::Display for LoadpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadpointRef::Car(id) => write!(f, "{}", id),
            LoadpointRef::Connector(id) => write!(f, "{}", id),
        }
    }
}

/// Charging mode of a loadpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    /// Never charge
    Off,
    /// The engine leaves the loadpoint alone
    Manual,
    /// Charge from solar surplus only
    PvOnly,
    /// Charge at maximum power whenever plugged in
    MaxPower,
    /// Meet charging targets, use surplus opportunistically
    #[default]
    Auto,
}

impl ChargeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeMode::Off => "off",
            ChargeMode::Manual => "manual",
            ChargeMode::PvOnly => "pv_only",
            ChargeMode::MaxPower => "max_power",
            ChargeMode::Auto => "auto",
        }
    }
}

impl std::str::FromStr for ChargeMode {
    type Err = crate::error::HelioError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_lowercase().as_str() {
            "off" => Ok(ChargeMode::Off),
            "manual" => Ok(ChargeMode::Manual),
            "pv_only" | "pvonly" => Ok(ChargeMode::PvOnly),
            "max_power" | "maxpower" => Ok(ChargeMode::MaxPower),
            "auto" => Ok(ChargeMode::Auto),
            other => Err(crate::error::HelioError::validation(
                "charge_mode".to_string(),
                format!("unknown charge mode '{}'", other),
            )),
        }
    }
}

/// A car, a connector, or a car charging through a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Loadpoint {
    pub car: Option<CarId>,
    pub connector: Option<ConnectorId>,
    /// Commands go to the car rather than to the connector
    pub manage_by_car: bool,
}

impl Loadpoint {
    /// The device that receives commands for this loadpoint
    pub fn target(&self) -> Option<LoadpointRef> {
        match (self.car, self.connector) {
            (Some(car), _) if self.manage_by_car => Some(LoadpointRef::Car(car)),
            (_, Some(connector)) => Some(LoadpointRef::Connector(connector)),
            (Some(car), None) => Some(LoadpointRef::Car(car)),
            (None, None) => None,
        }
    }
}

/// Which meter signals the site provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AvailablePowerSources {
    pub grid_power_available: bool,
    pub inverter_power_available: bool,
    pub home_battery_power_available: bool,
}

/// Car-side limits that take part in constraint resolution
#[derive(Debug, Clone, Copy, Default)]
pub struct CarLimits {
    pub min_current: Option<f64>,
    pub max_current: Option<f64>,
    pub max_phases: Option<u8>,
    pub soc_limit: Option<f64>,
}

/// Connector-side limits that take part in constraint resolution
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorLimits {
    pub min_current: Option<f64>,
    pub max_current: Option<f64>,
    pub min_phases: Option<u8>,
    pub max_phases: Option<u8>,
    pub can_switch_phases: bool,
}

/// Resolved per-tick limits of a loadpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConstraintValues {
    pub min_current: f64,
    pub max_current: f64,
    pub min_phases: u8,
    pub max_phases: u8,
    pub can_change_phases: bool,
    pub charge_mode: ChargeMode,
    pub max_soc: Option<f64>,
}

fn tightest<T: PartialOrd + Copy>(a: Option<T>, b: Option<T>, pick_min: bool) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if (x < y) == pick_min { x } else { y }),
        (x, None) => x,
        (None, y) => y,
    }
}

impl ConstraintValues {
    /// Intersect car and connector limits.
    ///
    /// Maximums take the smaller side, minimums the larger one. Returns `None`
    /// when a bound is unknown on both sides or the bounds contradict each
    /// other, so the loadpoint is skipped instead of guessed.
    pub fn resolve(
        car: Option<&CarLimits>,
        connector: Option<&ConnectorLimits>,
        charge_mode: ChargeMode,
    ) -> Option<Self> {
        let min_current = tightest(
            car.and_then(|c| c.min_current),
            connector.and_then(|c| c.min_current),
            false,
        )?;
        let max_current = tightest(
            car.and_then(|c| c.max_current),
            connector.and_then(|c| c.max_current),
            true,
        )?;
        let max_phases = tightest(
            car.and_then(|c| c.max_phases),
            connector.and_then(|c| c.max_phases),
            true,
        )?;
        let connector_switches = connector.is_some_and(|c| c.can_switch_phases);
        let min_phases = if connector_switches {
            connector.and_then(|c| c.min_phases).unwrap_or(1).min(max_phases)
        } else {
            max_phases
        };
        if min_current > max_current || max_phases == 0 {
            return None;
        }
        Some(Self {
            min_current,
            max_current,
            min_phases,
            max_phases,
            can_change_phases: connector_switches && min_phases < max_phases,
            charge_mode,
            max_soc: car.and_then(|c| c.soc_limit),
        })
    }

    pub fn min_power(&self, voltage: f64) -> f64 {
        self.min_current * voltage * f64::from(self.min_phases)
    }

    pub fn max_power(&self, voltage: f64) -> f64 {
        self.max_current * voltage * f64::from(self.max_phases)
    }
}
