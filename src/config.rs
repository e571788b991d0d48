//! Configuration management for Heliocharge
//!
//! This module handles loading, validation, and management of the engine
//! configuration from YAML files. Optional sections that are absent disable
//! the corresponding feature instead of failing.

use crate::error::{HelioError, Result};
use crate::loadpoint::ChargeMode;
use crate::targets::ChargingTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

mod defaults;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Diagnostics web server binding
    pub web: WebConfig,

    /// Control loop timing and thresholds
    pub control: ControlConfig,

    /// Schedule generation knobs
    pub charging: ChargingConfig,

    /// Home battery reservation
    pub home_battery: HomeBatteryConfig,

    /// Inverter limits
    pub inverter: InverterConfig,

    /// Site location, used for sun events and the home geofence
    pub location: LocationConfig,

    /// Static price fallback
    pub pricing: PricingConfig,

    /// Tibber API configuration for dynamic pricing
    pub tibber: TibberConfig,

    /// Cars known to the engine
    pub cars: Vec<CarConfig>,

    /// OCPP connectors known to the engine
    pub connectors: Vec<ConnectorConfig>,

    /// Site timezone, used when a target carries no zone of its own
    pub timezone: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to the log file or log directory
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

/// Control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Period of the control tick
    pub tick_interval_ms: u64,

    /// Phase voltage used to convert between current and power
    pub nominal_voltage: f64,

    /// Power kept back from the budget in watts
    pub power_buffer_w: f64,

    /// Window over which grid overage samples are averaged
    pub overage_average_seconds: u64,

    /// How long the start condition must hold before charging starts
    pub switch_on_delay_seconds: u64,

    /// How long the stop condition must hold before charging stops
    pub switch_off_delay_seconds: u64,

    /// Extra power above minimum power required to start
    pub switch_on_offset_w: f64,

    /// Power below minimum power tolerated before stopping
    pub switch_off_offset_w: f64,

    /// Hysteresis band around the 1/3 phase switch points
    pub phase_hysteresis_w: f64,

    /// Minimum time between two phase switches
    pub phase_switch_cooldown_seconds: u64,

    /// Smallest current change worth sending to a device
    pub current_update_threshold_a: f64,
}

/// Charging schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargingConfig {
    /// Charging loss in percent added on top of the battery energy
    pub charge_loss_percent: f64,

    /// Plan charging into forecast solar surplus
    pub use_solar_prediction: bool,

    /// Cover remaining energy in the cheapest price windows
    pub use_price_optimization: bool,

    /// Gap to the next slot that is bridged at minimum power instead of stopping
    pub switch_bridge_minutes: i64,

    /// How far ahead forecasts are requested
    pub forecast_horizon_hours: i64,
}

/// Home battery configuration. Unset capacity disables the reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeBatteryConfig {
    pub usable_energy_wh: Option<f64>,
    pub max_charging_power_w: Option<f64>,
    pub min_soc_percent: Option<f64>,
    pub dynamic_min_soc: bool,
    pub max_dynamic_min_soc_percent: f64,
    pub dynamic_min_soc_buffer_percent: f64,
    pub force_full_by_sunset: bool,
}

/// Inverter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    /// Maximum AC output of the inverter in watts
    pub max_ac_power_w: Option<f64>,
}

/// Location configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Geofence radius around home in meters
    pub home_radius_m: f64,
}

/// Pricing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Flat grid price per kWh when no dynamic tariff is used
    pub static_grid_price: f64,
}

/// Tibber API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TibberConfig {
    /// Tibber API access token
    pub access_token: String,

    /// Whether Tibber integration is enabled
    pub enabled: bool,

    /// Optional specific home ID
    pub home_id: String,

    /// API endpoint
    pub api_url: String,
}

/// Static capabilities of a car
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vin: Option<String>,
    pub usable_energy_kwh: Option<f64>,
    #[serde(default)]
    pub min_current: Option<f64>,
    #[serde(default)]
    pub max_current: Option<f64>,
    #[serde(default)]
    pub max_phases: Option<u8>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub charge_mode: ChargeMode,
    /// Send commands to the car instead of the connector it is plugged into
    #[serde(default)]
    pub manage_by_car: bool,
    #[serde(default)]
    pub charging_targets: Vec<ChargingTarget>,
}

/// Static capabilities of an OCPP connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub min_current: f64,
    pub max_current: f64,
    /// Phases physically wired to the connector
    pub connected_phases: u8,
    #[serde(default)]
    pub can_switch_phases: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub charge_mode: ChargeMode,
    /// Car statically paired with this connector
    #[serde(default)]
    pub paired_car_id: Option<u32>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "heliocharge.yaml",
            "/data/heliocharge.yaml",
            "/etc/heliocharge/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.control.tick_interval_ms == 0 {
            return Err(HelioError::validation(
                "control.tick_interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.control.nominal_voltage <= 0.0 {
            return Err(HelioError::validation(
                "control.nominal_voltage",
                "Must be positive",
            ));
        }

        if !(0.0..100.0).contains(&self.charging.charge_loss_percent) {
            return Err(HelioError::validation(
                "charging.charge_loss_percent",
                "Must be in [0, 100)",
            ));
        }

        if let Some(min_soc) = self.home_battery.min_soc_percent {
            if !(0.0..=100.0).contains(&min_soc) {
                return Err(HelioError::validation(
                    "home_battery.min_soc_percent",
                    "Must be in [0, 100]",
                ));
            }
            if self.home_battery.dynamic_min_soc
                && self.home_battery.max_dynamic_min_soc_percent < min_soc
            {
                return Err(HelioError::validation(
                    "home_battery.max_dynamic_min_soc_percent",
                    "Must not be below min_soc_percent",
                ));
            }
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(HelioError::validation(
                "timezone",
                format!("Unknown timezone '{}'", self.timezone),
            ));
        }

        let mut car_ids = HashSet::new();
        for car in &self.cars {
            if !car_ids.insert(car.id) {
                return Err(HelioError::validation(
                    "cars.id",
                    format!("Duplicate car id {}", car.id),
                ));
            }
            if let Some(phases) = car.max_phases
                && !(1..=3).contains(&phases)
            {
                return Err(HelioError::validation(
                    "cars.max_phases",
                    format!("Car {} phases must be 1..=3", car.id),
                ));
            }
            if let (Some(min), Some(max)) = (car.min_current, car.max_current)
                && min > max
            {
                return Err(HelioError::validation(
                    "cars.min_current",
                    format!("Car {} min current exceeds max current", car.id),
                ));
            }
        }

        let mut connector_ids = HashSet::new();
        for connector in &self.connectors {
            if !connector_ids.insert(connector.id) {
                return Err(HelioError::validation(
                    "connectors.id",
                    format!("Duplicate connector id {}", connector.id),
                ));
            }
            if !(1..=3).contains(&connector.connected_phases) {
                return Err(HelioError::validation(
                    "connectors.connected_phases",
                    format!("Connector {} phases must be 1..=3", connector.id),
                ));
            }
            if connector.min_current > connector.max_current {
                return Err(HelioError::validation(
                    "connectors.min_current",
                    format!("Connector {} min current exceeds max current", connector.id),
                ));
            }
            if let Some(car) = connector.paired_car_id
                && !car_ids.contains(&car)
            {
                return Err(HelioError::validation(
                    "connectors.paired_car_id",
                    format!("Connector {} is paired with unknown car {}", connector.id, car),
                ));
            }
        }

        Ok(())
    }

    /// Home battery capacity, if the reservation feature is configured
    pub fn home_battery_enabled(&self) -> bool {
        self.home_battery.usable_energy_wh.is_some_and(|e| e > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.control.tick_interval_ms, 30_000);
        assert_eq!(config.control.nominal_voltage, 230.0);
        assert_eq!(config.charging.switch_bridge_minutes, 20);
        assert!(config.home_battery.usable_energy_wh.is_none());
        assert!(!config.home_battery_enabled());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.control.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.home_battery.min_soc_percent = Some(30.0);
        config.home_battery.dynamic_min_soc = true;
        config.home_battery.max_dynamic_min_soc_percent = 20.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
control:
  power_buffer_w: 150
connectors:
  - id: 1
    min_current: 6
    max_current: 16
    connected_phases: 3
    can_switch_phases: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.control.power_buffer_w, 150.0);
        assert_eq!(config.control.switch_off_delay_seconds, 300);
        assert_eq!(config.connectors.len(), 1);
        assert_eq!(config.connectors[0].charge_mode, ChargeMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pricing_section_only_carries_the_static_price() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        assert!(yaml.contains("static_grid_price"));
        assert!(!yaml.contains("currency"));

        // older files with a currency entry still load
        let config: Config =
            serde_yaml::from_str("pricing:\n  static_grid_price: 0.31\n  currency_symbol: EUR\n").unwrap();
        assert_eq!(config.pricing.static_grid_price, 0.31);
    }

    #[test]
    fn test_unknown_pairing_rejected() {
        let mut config = Config::default();
        config.connectors.push(ConnectorConfig {
            id: 1,
            name: String::new(),
            min_current: 6.0,
            max_current: 16.0,
            connected_phases: 3,
            can_switch_phases: false,
            priority: 0,
            charge_mode: ChargeMode::Auto,
            paired_car_id: Some(9),
        });
        assert!(config.validate().is_err());
    }
}
