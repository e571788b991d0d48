//! Control loop of the charging engine
//!
//! The driver owns the tick: it fetches forecast and prices, refreshes the
//! geofence and the home battery minimum, computes the budget, regenerates
//! schedules, runs hysteresis and dispatches commands, then publishes a
//! snapshot for diagnostics readers.

mod commands;
mod runtime;
mod snapshot;
mod tick;
mod types;

pub use types::{DriverCommand, DriverSnapshot, DriverState, TickStepDurations};

use crate::config::Config;
use crate::dispatch::{
    CarCommandSink, ConnectorCommandSink, Dispatcher, LoggingCarSink, LoggingConnectorSink,
};
use crate::forecast::{ForecastProvider, NoForecast};
use crate::home_battery::BatteryModel;
use crate::logging::StructuredLogger;
use crate::pricing::{PriceProvider, StaticPriceProvider};
use crate::state::StateStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub forecast: Arc<dyn ForecastProvider>,
    pub prices: Arc<dyn PriceProvider>,
    pub cars: Arc<dyn CarCommandSink>,
    pub connectors: Arc<dyn ConnectorCommandSink>,
}

impl Collaborators {
    /// No forecast, the configured flat tariff, and sinks that only log
    pub fn dry_run(config: &Config) -> Self {
        Self {
            forecast: Arc::new(NoForecast),
            prices: Arc::new(StaticPriceProvider::new(config.pricing.static_grid_price)),
            cars: Arc::new(LoggingCarSink::new()),
            connectors: Arc::new(LoggingConnectorSink::new()),
        }
    }
}

/// Main driver for the charging engine
pub struct ChargeEngine {
    config: Config,

    /// Shared with ingestion and the web API
    store: StateStore,

    forecast: Arc<dyn ForecastProvider>,
    prices: Arc<dyn PriceProvider>,
    dispatcher: Dispatcher,

    /// Present when a home battery capacity is configured
    battery: Option<BatteryModel>,

    logger: StructuredLogger,

    /// Current driver state
    state: watch::Sender<DriverState>,
    state_rx: watch::Receiver<DriverState>,

    /// Last tick result
    snapshot_tx: watch::Sender<Arc<DriverSnapshot>>,
    snapshot_rx: watch::Receiver<Arc<DriverSnapshot>>,

    /// Command receiver for external control
    commands_rx: mpsc::UnboundedReceiver<DriverCommand>,

    /// Cancels the running tick and the main loop
    cancel: CancellationToken,

    total_ticks: u64,
    overrun_count: u64,
}
