//! Timestamped observations
//!
//! Every external signal entering the engine is stored as a [`Timestamped`]
//! cell. Updates carrying a timestamp that is not strictly newer than the one
//! already stored are dropped, so out-of-order deliveries from MQTT, OCPP or
//! cloud polling can never overwrite fresher data.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// A value together with when it was observed and when it last changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    value: T,
    timestamp: DateTime<Utc>,
    last_changed: Option<DateTime<Utc>>,
}

impl<T: PartialEq> Timestamped<T> {
    /// Create an observation that was seen at `timestamp`
    pub fn new(value: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp,
            last_changed: Some(timestamp),
        }
    }

    /// Apply a new observation.
    ///
    /// Returns `true` when the observation was accepted. `last_changed` only
    /// moves when the value differs from the stored one.
    pub fn update(&mut self, timestamp: DateTime<Utc>, value: T) -> bool {
        if timestamp <= self.timestamp {
            return false;
        }
        self.timestamp = timestamp;
        if self.value != value {
            self.value = value;
            self.last_changed = Some(timestamp);
        }
        true
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.last_changed
    }

    /// How long the current value has been held, if the change time is known
    pub fn held_for(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.last_changed.map(|changed| now - changed)
    }
}

impl<T: PartialEq + Copy> Timestamped<T> {
    pub fn get(&self) -> T {
        self.value
    }
}

impl<T> Timestamped<Option<T>> {
    /// An attribute that has never been observed
    pub fn unknown() -> Self {
        Self {
            value: None,
            timestamp: DateTime::<Utc>::MIN_UTC,
            last_changed: None,
        }
    }
}

impl<T> Default for Timestamped<Option<T>> {
    fn default() -> Self {
        Self::unknown()
    }
}

impl Timestamped<bool> {
    /// A flag that starts out `false` and has never been observed
    pub fn unset() -> Self {
        Self {
            value: false,
            timestamp: DateTime::<Utc>::MIN_UTC,
            last_changed: None,
        }
    }

    /// Whether the flag is set and has been set continuously for at least `min`
    pub fn true_for_at_least(&self, now: DateTime<Utc>, min: TimeDelta) -> bool {
        self.value && self.held_for(now).is_some_and(|held| held >= min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn newer_update_changes_value_and_last_changed() {
        let mut obs = Timestamped::new(10.0, at(0));
        assert!(obs.update(at(5), 12.0));
        assert_eq!(obs.get(), 12.0);
        assert_eq!(obs.timestamp(), at(5));
        assert_eq!(obs.last_changed(), Some(at(5)));
    }

    #[test]
    fn same_value_only_moves_timestamp() {
        let mut obs = Timestamped::new(true, at(0));
        assert!(obs.update(at(10), true));
        assert_eq!(obs.timestamp(), at(10));
        assert_eq!(obs.last_changed(), Some(at(0)));
    }

    #[test]
    fn stale_or_equal_timestamps_are_ignored() {
        let mut obs = Timestamped::new(3_u8, at(10));
        assert!(!obs.update(at(10), 1));
        assert!(!obs.update(at(9), 2));
        assert_eq!(obs.get(), 3);
        assert_eq!(obs.timestamp(), at(10));
        assert_eq!(obs.last_changed(), Some(at(10)));

        // repeating the stale update any number of times stays a no-op
        for _ in 0..3 {
            assert!(!obs.update(at(1), 7));
        }
        assert_eq!(obs.get(), 3);
        assert_eq!(obs.last_changed(), Some(at(10)));
    }

    #[test]
    fn unknown_accepts_first_observation() {
        let mut soc: Timestamped<Option<f64>> = Timestamped::unknown();
        assert_eq!(soc.last_changed(), None);
        assert!(soc.update(at(0), Some(55.0)));
        assert_eq!(soc.value(), &Some(55.0));
        assert_eq!(soc.last_changed(), Some(at(0)));
    }

    #[test]
    fn debounce_requires_continuous_hold() {
        let mut flag = Timestamped::unset();
        assert!(!flag.true_for_at_least(at(100), TimeDelta::seconds(1)));
        flag.update(at(0), true);
        assert!(!flag.true_for_at_least(at(30), TimeDelta::seconds(60)));
        assert!(flag.true_for_at_least(at(60), TimeDelta::seconds(60)));
        flag.update(at(70), false);
        flag.update(at(80), true);
        assert!(!flag.true_for_at_least(at(100), TimeDelta::seconds(60)));
    }
}
