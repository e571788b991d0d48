use crate::dispatch::DispatchOutcome;
use crate::hysteresis::HysteresisDecision;
use crate::loadpoint::{ChargeMode, LoadpointRef};
use crate::reasons::LoadpointReasons;
use crate::schedule::ChargingSchedule;
use serde::Serialize;

/// Main driver state
#[derive(Debug, Clone, PartialEq)]
pub enum DriverState {
    /// Driver is initializing
    Initializing,
    /// Driver is running normally
    Running,
    /// Driver is in error state
    Error(String),
    /// Driver is shutting down
    ShuttingDown,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverState::Initializing => write!(f, "Initializing"),
            DriverState::Running => write!(f, "Running"),
            DriverState::Error(e) => write!(f, "Error: {}", e),
            DriverState::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Per-step timings of a single control tick in milliseconds
#[derive(Debug, Clone, Serialize, Default)]
pub struct TickStepDurations {
    /// Forecast and price fetch
    pub fetch_inputs_ms: Option<u64>,
    /// Home geofence refresh
    pub geofence_ms: Option<u64>,
    /// Dynamic home battery minimum
    pub battery_ms: Option<u64>,
    pub budget_ms: Option<u64>,
    /// Generation, switch-time optimisation and publication
    pub schedule_ms: Option<u64>,
    pub hysteresis_ms: Option<u64>,
    /// Sink calls for all loadpoints
    pub dispatch_ms: Option<u64>,
    /// Charging target bookkeeping
    pub targets_ms: Option<u64>,
}

/// Result of the last control tick, as served to diagnostics readers
#[derive(Debug, Clone, Serialize)]
pub struct DriverSnapshot {
    pub timestamp: String,
    /// Driver state (Initializing, Running, Error, ShuttingDown)
    pub driver_state: String,
    pub total_ticks: u64,
    pub overrun_count: u64,
    pub tick_interval_ms: u64,
    pub tick_duration_ms: Option<u64>,
    /// Signed power available to charging; `None` without meter data
    pub power_budget_w: Option<f64>,
    pub dynamic_min_soc: Option<f64>,
    pub global_reasons: Vec<String>,
    pub reasons: Vec<LoadpointReasons>,
    pub decisions: Vec<HysteresisDecision>,
    pub dispatch: Vec<DispatchOutcome>,
    pub schedules: Vec<ChargingSchedule>,
    pub steps_ms: Option<TickStepDurations>,
}

impl DriverSnapshot {
    pub(crate) fn initial(tick_interval_ms: u64) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            driver_state: DriverState::Initializing.to_string(),
            total_ticks: 0,
            overrun_count: 0,
            tick_interval_ms,
            tick_duration_ms: None,
            power_budget_w: None,
            dynamic_min_soc: None,
            global_reasons: Vec::new(),
            reasons: Vec::new(),
            decisions: Vec::new(),
            dispatch: Vec::new(),
            schedules: Vec::new(),
            steps_ms: None,
        }
    }
}

/// Commands accepted by the driver from external components (web, etc.)
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    SetChargeMode(LoadpointRef, ChargeMode),
    SetPriority(LoadpointRef, i32),
    /// Run a control tick now instead of waiting for the timer
    TriggerTick,
    Shutdown,
}
