//! # Heliocharge - solar-aware charging engine for EV loadpoints
//!
//! Decides, once per control tick, how much power each car or OCPP connector
//! may draw and plans charging slots that meet the drivers' targets from
//! solar surplus first and the cheapest grid hours after that.
//!
//! ## Architecture
//!
//! - `observation`: timestamped values with stale-update protection
//! - `interval`: time interval overlap and splitting
//! - `state`: the shared engine state store
//! - `budget`: power available for surplus charging this tick
//! - `home_battery`: battery simulation and the dynamic minimum SoC
//! - `schedule`: charging slot generation, merging and switch-time bridging
//! - `hysteresis`: start/stop and phase recommendations per loadpoint
//! - `dispatch`: turning decisions into device commands
//! - `driver`: the control loop tying it together
//! - `web`: diagnostics HTTP API
//! - `tibber`: Tibber price curve provider

pub mod budget;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod forecast;
pub mod home_battery;
pub mod hysteresis;
pub mod interval;
pub mod loadpoint;
pub mod logging;
pub mod observation;
pub mod pricing;
pub mod reasons;
pub mod schedule;
pub mod state;
pub mod targets;
#[cfg(feature = "tibber")]
pub mod tibber;
#[cfg(feature = "web")]
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use driver::{ChargeEngine, Collaborators, DriverCommand, DriverSnapshot};
pub use error::{HelioError, Result};
pub use loadpoint::{CarId, ChargeMode, ConnectorId, LoadpointRef};
pub use state::StateStore;
