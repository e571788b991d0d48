use super::ChargingSchedule;
use crate::interval::{TimeInterval, hours, split_by_boundaries};

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Merge `candidate` into the schedules of its loadpoint and return the
/// energy in Wh this actually adds.
///
/// Where the candidate overlaps an existing slot the slot keeps the higher
/// of both powers, never above `max_power`. Minimum and solar annotations
/// take the maximum of both sides. Slots of other loadpoints are untouched.
///
/// # Panics
///
/// When `candidate` does not end after it starts.
pub fn add_charging_schedule(
    schedules: &mut Vec<ChargingSchedule>,
    candidate: &ChargingSchedule,
    max_power: f64,
) -> f64 {
    assert!(
        candidate.valid_from < candidate.valid_to,
        "candidate schedule has non-positive length: {} >= {}",
        candidate.valid_from,
        candidate.valid_to
    );
    if candidate.charging_power <= 0.0 {
        return 0.0;
    }
    let loadpoint = candidate.loadpoint;
    let (own, others): (Vec<_>, Vec<_>) = schedules
        .drain(..)
        .partition(|s| s.loadpoint == loadpoint);

    let (mut merged, pieces) = split_by_boundaries(
        &own,
        std::slice::from_ref(candidate),
        candidate.valid_from,
        candidate.valid_to,
        true,
    );

    let mut added = 0.0;
    for mut piece in pieces {
        let h = hours(piece.duration());
        piece.charging_power = piece.charging_power.min(max_power);
        piece.target_min_power = piece.target_min_power.map(|w| w.min(max_power));

        match merged
            .iter_mut()
            .find(|m| m.valid_from == piece.valid_from && m.valid_to == piece.valid_to)
        {
            Some(existing) => {
                let power = existing.charging_power.max(piece.charging_power);
                added += (power - existing.charging_power) * h;
                existing.charging_power = power;
                existing.target_min_power =
                    max_opt(existing.target_min_power, piece.target_min_power);
                existing.estimated_solar_power =
                    max_opt(existing.estimated_solar_power, piece.estimated_solar_power);
            }
            None => {
                added += piece.charging_power * h;
                merged.push(piece);
            }
        }
    }

    merged.sort_by_key(|s| s.valid_from);
    coalesce(&mut merged);

    schedules.extend(others);
    schedules.extend(merged);
    schedules.sort_by(|a, b| {
        (a.loadpoint, a.valid_from).cmp(&(b.loadpoint, b.valid_from))
    });
    added
}

/// Energy `candidate` would add, without changing `schedules`
pub(crate) fn energy_added(
    schedules: &[ChargingSchedule],
    candidate: &ChargingSchedule,
    max_power: f64,
) -> f64 {
    let mut dry_run: Vec<ChargingSchedule> = schedules
        .iter()
        .filter(|s| s.loadpoint == candidate.loadpoint)
        .cloned()
        .collect();
    add_charging_schedule(&mut dry_run, candidate, max_power)
}

/// Join touching slots of one loadpoint that carry identical values.
/// Expects `schedules` sorted by loadpoint and start.
pub fn coalesce(schedules: &mut Vec<ChargingSchedule>) {
    let mut out: Vec<ChargingSchedule> = Vec::with_capacity(schedules.len());
    for item in schedules.drain(..) {
        if let Some(last) = out.last_mut()
            && last.loadpoint == item.loadpoint
            && last.valid_to == item.valid_from
            && last.charging_power == item.charging_power
            && last.target_min_power == item.target_min_power
            && last.estimated_solar_power == item.estimated_solar_power
        {
            last.valid_to = item.valid_to;
            continue;
        }
        out.push(item);
    }
    *schedules = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadpoint::{CarId, ConnectorId, LoadpointRef};
    use chrono::{DateTime, TimeZone, Utc};

    const CAR: LoadpointRef = LoadpointRef::Car(CarId(1));

    fn h(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).unwrap()
    }

    fn total_energy(schedules: &[ChargingSchedule]) -> f64 {
        schedules.iter().map(ChargingSchedule::energy_wh).sum()
    }

    #[test]
    fn overlapping_candidate_adds_only_the_increase() {
        let mut schedules = vec![ChargingSchedule::new(CAR, h(10), h(12), 3000.0)];
        let added = add_charging_schedule(
            &mut schedules,
            &ChargingSchedule::new(CAR, h(11), h(13), 5000.0),
            11_000.0,
        );

        assert_eq!(added, 7000.0);
        assert_eq!(total_energy(&schedules), 13_000.0);
        assert_eq!(schedules.len(), 2);
        assert_eq!((schedules[0].valid_from, schedules[0].valid_to), (h(10), h(11)));
        assert_eq!((schedules[1].valid_from, schedules[1].valid_to), (h(11), h(13)));
        assert_eq!(schedules[1].charging_power, 5000.0);
    }

    #[test]
    fn disjoint_candidates_conserve_energy() {
        let mut schedules = Vec::new();
        let mut added = 0.0;
        for (from, to, watts) in [(8, 9, 1500.0), (9, 11, 2500.0), (14, 15, 7000.0)] {
            added += add_charging_schedule(
                &mut schedules,
                &ChargingSchedule::new(CAR, h(from), h(to), watts),
                11_000.0,
            );
        }
        assert_eq!(added, total_energy(&schedules));
        assert_eq!(added, 1500.0 + 5000.0 + 7000.0);
    }

    #[test]
    fn max_power_caps_and_annotations_take_the_maximum() {
        let mut schedules = Vec::new();
        add_charging_schedule(
            &mut schedules,
            &ChargingSchedule::new(CAR, h(10), h(11), 2000.0).with_target_min_power(2000.0),
            4000.0,
        );
        let added = add_charging_schedule(
            &mut schedules,
            &ChargingSchedule::new(CAR, h(10), h(11), 9000.0)
                .with_target_min_power(3000.0)
                .with_estimated_solar_power(9000.0),
            4000.0,
        );

        assert_eq!(added, 2000.0);
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].charging_power, 4000.0);
        assert_eq!(schedules[0].target_min_power, Some(3000.0));
        assert_eq!(schedules[0].estimated_solar_power, Some(9000.0));
    }

    #[test]
    fn other_loadpoints_are_left_alone() {
        let wallbox = LoadpointRef::Connector(ConnectorId(7));
        let mut schedules = vec![ChargingSchedule::new(wallbox, h(10), h(12), 3000.0)];
        let added = add_charging_schedule(
            &mut schedules,
            &ChargingSchedule::new(CAR, h(10), h(12), 3000.0),
            11_000.0,
        );
        assert_eq!(added, 6000.0);
        assert_eq!(schedules.len(), 2);
        assert!(schedules.iter().any(|s| s.loadpoint == wallbox && s.charging_power == 3000.0));
    }

    #[test]
    fn dry_run_leaves_the_list_unchanged() {
        let schedules = vec![ChargingSchedule::new(CAR, h(10), h(12), 3000.0)];
        let candidate = ChargingSchedule::new(CAR, h(11), h(12), 4000.0);
        assert_eq!(energy_added(&schedules, &candidate, 11_000.0), 1000.0);
        assert_eq!(schedules.len(), 1);
    }

    #[test]
    fn zero_power_candidate_is_ignored() {
        let mut schedules = Vec::new();
        let added =
            add_charging_schedule(&mut schedules, &ChargingSchedule::new(CAR, h(10), h(11), 0.0), 1.0);
        assert_eq!(added, 0.0);
        assert!(schedules.is_empty());
    }

    #[test]
    #[should_panic(expected = "non-positive length")]
    fn reversed_candidate_is_rejected() {
        let mut schedules = vec![ChargingSchedule::new(CAR, h(10), h(12), 3000.0)];
        let candidate = ChargingSchedule::new(CAR, h(12), h(11), 3000.0);
        add_charging_schedule(&mut schedules, &candidate, 11_000.0);
    }

    #[test]
    #[should_panic(expected = "non-positive length")]
    fn empty_candidate_is_rejected() {
        let mut schedules = Vec::new();
        let candidate = ChargingSchedule::new(CAR, h(11), h(11), 3000.0);
        add_charging_schedule(&mut schedules, &candidate, 11_000.0);
    }
}
