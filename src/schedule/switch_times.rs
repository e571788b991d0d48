//! Avoid short stop/start cycles between planned slots
//!
//! A loadpoint that is charging now but has nothing planned until a slot a
//! few minutes away would be stopped and restarted. Instead it keeps running
//! at minimum power until that slot, which is lowered by the bridged energy.

use super::{ChargingSchedule, active_at, next_after};
use crate::interval::{TimeInterval, hours};
use crate::loadpoint::LoadpointRef;
use chrono::{DateTime, TimeDelta, Utc};

/// A loadpoint that is currently charging
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchCandidate {
    pub loadpoint: LoadpointRef,
    pub min_power: f64,
}

/// Insert bridge slots; returns the loadpoints that got one
pub fn optimize_charging_switch_times(
    schedules: &mut Vec<ChargingSchedule>,
    charging: &[SwitchCandidate],
    now: DateTime<Utc>,
    bridge_window: TimeDelta,
) -> Vec<LoadpointRef> {
    let mut bridged = Vec::new();

    for candidate in charging {
        let lp = candidate.loadpoint;
        if active_at(schedules, lp, now).is_some() {
            continue;
        }
        let Some(next) = next_after(schedules, lp, now).cloned() else {
            continue;
        };
        let gap = next.valid_from - now;
        if gap > bridge_window || candidate.min_power <= 0.0 {
            continue;
        }

        let next_hours = hours(next.duration());
        let bridge_energy = candidate.min_power * hours(gap);
        let reduced = (next.energy_wh() - bridge_energy) / next_hours;
        if reduced < candidate.min_power {
            continue;
        }

        if let Some(slot) = schedules
            .iter_mut()
            .find(|s| s.loadpoint == lp && s.valid_from == next.valid_from)
        {
            slot.charging_power = reduced;
            slot.target_min_power = slot.target_min_power.map(|w| w.min(reduced));
        }
        schedules.push(
            ChargingSchedule::new(lp, now, next.valid_from, candidate.min_power)
                .with_target_min_power(candidate.min_power),
        );
        bridged.push(lp);
    }

    schedules.sort_by(|a, b| {
        (a.loadpoint, a.valid_from).cmp(&(b.loadpoint, b.valid_from))
    });
    bridged
}
