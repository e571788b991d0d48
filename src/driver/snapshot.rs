use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::ChargeEngine;
use super::tick::TickOutcome;
use super::types::DriverSnapshot;

impl ChargeEngine {
    pub(super) fn publish_snapshot(
        &self,
        now: DateTime<Utc>,
        outcome: TickOutcome,
        tick_duration_ms: Option<u64>,
    ) -> Arc<DriverSnapshot> {
        let snapshot = Arc::new(DriverSnapshot {
            timestamp: now.to_rfc3339(),
            driver_state: self.current_state().to_string(),
            total_ticks: self.total_ticks,
            overrun_count: self.overrun_count,
            tick_interval_ms: self.config.control.tick_interval_ms,
            tick_duration_ms,
            power_budget_w: outcome.budget,
            dynamic_min_soc: outcome.dynamic_min_soc,
            global_reasons: outcome.reasons.global().to_vec(),
            reasons: outcome.reasons.entries(),
            decisions: outcome.decisions,
            dispatch: outcome.dispatch,
            schedules: outcome.schedules,
            steps_ms: Some(outcome.steps),
        });
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// Last published snapshot
    pub fn latest_snapshot(&self) -> Arc<DriverSnapshot> {
        Arc::clone(&self.snapshot_rx.borrow())
    }
}
