use super::{ChargeEngine, DriverCommand};

impl ChargeEngine {
    /// Apply an external command; `false` ends the main loop
    pub(crate) async fn handle_command(&mut self, cmd: DriverCommand) -> bool {
        match cmd {
            DriverCommand::SetChargeMode(target, mode) => {
                match self.store.set_charge_mode(target, mode) {
                    Ok(()) => self
                        .logger
                        .for_loadpoint(target)
                        .info(&format!("Charge mode set to {}", mode.as_str())),
                    Err(e) => self
                        .logger
                        .warn(&format!("Cannot set charge mode of {}: {}", target, e)),
                }
                true
            }
            DriverCommand::SetPriority(target, priority) => {
                match self.store.set_priority(target, priority) {
                    Ok(()) => self
                        .logger
                        .for_loadpoint(target)
                        .info(&format!("Priority set to {}", priority)),
                    Err(e) => self
                        .logger
                        .warn(&format!("Cannot set priority of {}: {}", target, e)),
                }
                true
            }
            DriverCommand::TriggerTick => {
                self.run_tick().await;
                true
            }
            DriverCommand::Shutdown => {
                self.cancel.cancel();
                false
            }
        }
    }
}
