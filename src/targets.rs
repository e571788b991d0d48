//! Charging targets: SoC-by-deadline goals attached to a car

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A one-shot or weekly recurring state-of-charge deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingTarget {
    pub target_soc: f64,
    /// Calendar date for a one-shot target
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    pub target_time: NaiveTime,
    /// Monday first
    #[serde(default)]
    pub repeat_on_weekdays: [bool; 7],
    /// IANA zone of `target_time`; the site timezone when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_time_zone: Option<String>,
    #[serde(default)]
    pub last_fulfilled: Option<DateTime<Utc>>,
}

/// A target resolved to a concrete UTC deadline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeZonedChargingTarget {
    /// Position of the source target in the car's target list
    pub index: usize,
    pub target_soc: f64,
    pub deadline: DateTime<Utc>,
}

fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    // Local times inside a DST gap move forward by the gap
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

impl ChargingTarget {
    fn repeats(&self) -> bool {
        self.repeat_on_weekdays.iter().any(|d| *d)
    }

    /// The instant this target is due, relative to `now`.
    ///
    /// One-shot targets resolve to their date even when it has passed. Weekly
    /// targets resolve to the next enabled weekday slot after `now`; targets
    /// with neither date nor weekdays recur daily. A target without a zone
    /// is read as UTC. `None` when the time zone is unknown.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz: Tz = match &self.client_time_zone {
            Some(zone) => zone.parse().ok()?,
            None => Tz::UTC,
        };
        let today = now.with_timezone(&tz).date_naive();

        if let Some(date) = self.target_date
            && !self.repeats()
        {
            return localize(tz, date.and_time(self.target_time));
        }

        (0..=7)
            .map(|offset| today + Duration::days(offset))
            .filter(|day| {
                !self.repeats()
                    || self.repeat_on_weekdays[day.weekday().num_days_from_monday() as usize]
            })
            .filter_map(|day| localize(tz, day.and_time(self.target_time)))
            .find(|slot| *slot > now)
    }

    /// Copy of this target with `site_zone` filled in when no zone is set
    pub fn in_site_zone(&self, site_zone: &str) -> Self {
        Self {
            client_time_zone: self
                .client_time_zone
                .clone()
                .or_else(|| Some(site_zone.to_string())),
            ..self.clone()
        }
    }

    /// Fulfilled once `last_fulfilled` is at or after the occurrence
    pub fn is_fulfilled(&self, occurrence: DateTime<Utc>) -> bool {
        self.last_fulfilled.is_some_and(|at| at >= occurrence)
    }
}

/// The unfulfilled target with the earliest deadline
pub fn nearest_unfulfilled(
    targets: &[ChargingTarget],
    now: DateTime<Utc>,
) -> Option<TimeZonedChargingTarget> {
    targets
        .iter()
        .enumerate()
        .filter_map(|(index, target)| {
            let deadline = target.next_occurrence(now)?;
            (!target.is_fulfilled(deadline)).then_some(TimeZonedChargingTarget {
                index,
                target_soc: target.target_soc,
                deadline,
            })
        })
        .min_by_key(|t| t.deadline)
}
