use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::error::Result;
use crate::home_battery::BatteryModel;
use crate::state::StateStore;

use super::types::{DriverCommand, DriverSnapshot, DriverState};
use super::{ChargeEngine, Collaborators};

impl ChargeEngine {
    /// Create a new driver instance on an existing state store
    pub fn new(
        config: Config,
        store: StateStore,
        collaborators: Collaborators,
        commands_rx: mpsc::UnboundedReceiver<DriverCommand>,
    ) -> Result<Self> {
        config.validate()?;

        let logger = crate::logging::get_logger("driver");
        logger.info("Initializing charging engine");

        let battery = BatteryModel::from_config(&config.home_battery);
        if battery.is_none() {
            logger.info("No home battery capacity configured, battery features disabled");
        }

        let (state_tx, state_rx) = watch::channel(DriverState::Initializing);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(DriverSnapshot::initial(
            config.control.tick_interval_ms,
        )));

        let dispatcher = Dispatcher::new(
            collaborators.cars,
            collaborators.connectors,
            DispatchSettings::from_config(&config),
        );

        Ok(Self {
            config,
            store,
            forecast: collaborators.forecast,
            prices: collaborators.prices,
            dispatcher,
            battery,
            logger,
            state: state_tx,
            state_rx,
            snapshot_tx,
            snapshot_rx,
            commands_rx,
            cancel: CancellationToken::new(),
            total_ticks: 0,
            overrun_count: 0,
        })
    }

    /// Run the driver main loop until shutdown or cancellation
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info("Starting charging engine main loop");
        self.state.send(DriverState::Running).ok();

        let period = Duration::from_millis(self.config.control.tick_interval_ms);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = std::time::Instant::now();
                    self.run_tick().await;
                    if started.elapsed() > period {
                        self.overrun_count += 1;
                        self.logger.warn(&format!(
                            "Tick took {} ms, longer than the {} ms interval",
                            started.elapsed().as_millis(),
                            period.as_millis()
                        ));
                    }
                }
                Some(cmd) = self.commands_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                _ = self.cancel.cancelled() => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.state.send(DriverState::ShuttingDown).ok();
        self.logger.info("Charging engine stopped");
        Ok(())
    }

    /// Token that stops the main loop and aborts a running tick between
    /// loadpoints
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DriverState> {
        self.state_rx.clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<DriverSnapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn current_state(&self) -> DriverState {
        self.state_rx.borrow().clone()
    }
}
