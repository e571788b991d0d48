//! Interval algebra shared by schedules and price curves
//!
//! Schedules and price curves are produced independently and rarely share
//! boundaries. [`split_by_boundaries`] re-cuts two lists onto a common set of
//! boundary instants so they can be compared interval for interval.

use chrono::{DateTime, TimeDelta, Utc};

/// A record that is valid over the half-open range `[valid_from, valid_to)`
pub trait TimeInterval: Clone {
    fn valid_from(&self) -> DateTime<Utc>;
    fn valid_to(&self) -> DateTime<Utc>;

    /// Copy of this record with every non-time field kept and new bounds
    fn with_bounds(&self, valid_from: DateTime<Utc>, valid_to: DateTime<Utc>) -> Self;

    fn duration(&self) -> TimeDelta {
        self.valid_to() - self.valid_from()
    }

    fn covers(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.valid_from() <= from && self.valid_to() >= to
    }

    fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.valid_from() <= instant && instant < self.valid_to()
    }
}

/// Fraction of an hour covered by `delta`
pub fn hours(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 3_600_000.0
}

/// Length of the overlap between `[a_from, a_to)` and `[b_from, b_to)`
pub fn overlap(
    a_from: DateTime<Utc>,
    a_to: DateTime<Utc>,
    b_from: DateTime<Utc>,
    b_to: DateTime<Utc>,
) -> TimeDelta {
    let start = a_from.max(b_from);
    let end = a_to.min(b_to);
    if end > start { end - start } else { TimeDelta::zero() }
}

fn assert_well_formed<I: TimeInterval>(list: &[I], side: &str) {
    for item in list {
        assert!(
            item.valid_from() < item.valid_to(),
            "{} interval has non-positive length: {} >= {}",
            side,
            item.valid_from(),
            item.valid_to()
        );
    }
}

fn collect_boundaries<L: TimeInterval, R: TimeInterval>(
    left: &[L],
    right: &[R],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let inside = |t: &DateTime<Utc>| *t >= window_start && *t <= window_end;
    let mut boundaries: Vec<DateTime<Utc>> = left
        .iter()
        .flat_map(|i| [i.valid_from(), i.valid_to()])
        .chain(right.iter().flat_map(|i| [i.valid_from(), i.valid_to()]))
        .filter(inside)
        .chain([window_start, window_end])
        .collect();
    boundaries.sort();
    boundaries.dedup();
    boundaries
}

fn cut<I: TimeInterval>(
    list: &[I],
    boundaries: &[DateTime<Utc>],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    include_outer: bool,
) -> Vec<I> {
    let mut out = Vec::new();
    if include_outer {
        for item in list {
            if item.valid_from() < window_start {
                let to = item.valid_to().min(window_start);
                out.push(item.with_bounds(item.valid_from(), to));
            }
        }
    }
    for pair in boundaries.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        if let Some(item) = list.iter().find(|i| i.covers(from, to)) {
            out.push(item.with_bounds(from, to));
        }
    }
    if include_outer {
        for item in list {
            if item.valid_to() > window_end {
                let from = item.valid_from().max(window_end);
                out.push(item.with_bounds(from, item.valid_to()));
            }
        }
    }
    out.sort_by_key(|i| i.valid_from());
    out
}

/// Align two interval lists on a shared set of boundary instants.
///
/// Boundaries are every `valid_from`/`valid_to` of both lists that falls
/// inside `[window_start, window_end]`, plus the window bounds themselves.
/// Each consecutive boundary pair yields at most one record per list, copied
/// from the interval of that list that fully covers the pair. With
/// `include_outer`, the parts of intervals lying outside the window are
/// emitted as well, clipped at the window edge.
///
/// # Panics
///
/// Panics if `window_start > window_end` or any input interval is empty or
/// reversed; both indicate a bug in the caller's boundary computation.
pub fn split_by_boundaries<L: TimeInterval, R: TimeInterval>(
    left: &[L],
    right: &[R],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    include_outer: bool,
) -> (Vec<L>, Vec<R>) {
    assert!(
        window_start <= window_end,
        "split window is reversed: {} > {}",
        window_start,
        window_end
    );
    assert_well_formed(left, "left");
    assert_well_formed(right, "right");

    let boundaries = collect_boundaries(left, right, window_start, window_end);
    (
        cut(left, &boundaries, window_start, window_end, include_outer),
        cut(right, &boundaries, window_start, window_end, include_outer),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq)]
    struct Power {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        watts: f64,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Price {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        price: f64,
    }

    impl TimeInterval for Power {
        fn valid_from(&self) -> DateTime<Utc> {
            self.from
        }
        fn valid_to(&self) -> DateTime<Utc> {
            self.to
        }
        fn with_bounds(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
            Self { from, to, ..self.clone() }
        }
    }

    impl TimeInterval for Price {
        fn valid_from(&self) -> DateTime<Utc> {
            self.from
        }
        fn valid_to(&self) -> DateTime<Utc> {
            self.to
        }
        fn with_bounds(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
            Self { from, to, ..self.clone() }
        }
    }

    fn h(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).unwrap()
    }

    fn hm(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).unwrap()
    }

    #[test]
    fn three_boundary_example() {
        let left = vec![Power { from: h(10), to: h(12), watts: 5.0 }];
        let right = vec![Price { from: h(11), to: h(13), price: 0.30 }];

        let (l, r) = split_by_boundaries(&left, &right, h(10), h(13), false);

        assert_eq!(
            l,
            vec![
                Power { from: h(10), to: h(11), watts: 5.0 },
                Power { from: h(11), to: h(12), watts: 5.0 },
            ]
        );
        assert_eq!(
            r,
            vec![
                Price { from: h(11), to: h(12), price: 0.30 },
                Price { from: h(12), to: h(13), price: 0.30 },
            ]
        );
    }

    #[test]
    fn outer_segments_are_clipped_at_window_edges() {
        let left = vec![
            Power { from: h(8), to: h(11), watts: 1.0 },
            Power { from: h(12), to: h(15), watts: 2.0 },
        ];
        let none: Vec<Price> = Vec::new();

        let (l, _) = split_by_boundaries(&left, &none, h(10), h(13), true);

        assert_eq!(
            l,
            vec![
                Power { from: h(8), to: h(10), watts: 1.0 },
                Power { from: h(10), to: h(11), watts: 1.0 },
                Power { from: h(12), to: h(13), watts: 2.0 },
                Power { from: h(13), to: h(15), watts: 2.0 },
            ]
        );
    }

    #[test]
    fn without_outer_segments_nothing_leaves_the_window() {
        let left = vec![Power { from: h(8), to: h(15), watts: 1.0 }];
        let none: Vec<Price> = Vec::new();
        let (l, _) = split_by_boundaries(&left, &none, h(10), h(13), false);
        assert_eq!(l, vec![Power { from: h(10), to: h(13), watts: 1.0 }]);
    }

    #[test]
    fn pieces_reassemble_the_overlapping_portion() {
        let left = vec![
            Power { from: hm(9, 15), to: hm(10, 40), watts: 3.0 },
            Power { from: hm(10, 40), to: hm(12, 5), watts: 4.0 },
            Power { from: hm(13, 0), to: hm(14, 30), watts: 6.0 },
        ];
        let right = vec![
            Price { from: h(9), to: h(10), price: 0.1 },
            Price { from: h(10), to: h(11), price: 0.2 },
            Price { from: hm(11, 30), to: h(14), price: 0.3 },
        ];
        let (ws, we) = (hm(9, 30), hm(14, 0));
        let (l, r) = split_by_boundaries(&left, &right, ws, we, false);

        // no overlaps, each piece inside its source, summed length matches
        for (pieces, sources) in [(
            l.iter().map(|p| (p.from, p.to, p.watts)).collect::<Vec<_>>(),
            left.iter().map(|p| (p.from, p.to, p.watts)).collect::<Vec<_>>(),
        ), (
            r.iter().map(|p| (p.from, p.to, p.price)).collect::<Vec<_>>(),
            right.iter().map(|p| (p.from, p.to, p.price)).collect::<Vec<_>>(),
        )] {
            for w in pieces.windows(2) {
                assert!(w[0].1 <= w[1].0);
            }
            let total: TimeDelta = pieces.iter().map(|(f, t, _)| *t - *f).sum();
            let expected: TimeDelta = sources
                .iter()
                .map(|(f, t, _)| overlap(*f, *t, ws, we))
                .sum();
            assert_eq!(total, expected);
            for (f, t, v) in &pieces {
                assert!(sources.iter().any(|(sf, st, sv)| sf <= f && st >= t && sv == v));
            }
        }
    }

    #[test]
    #[should_panic(expected = "reversed")]
    fn reversed_window_panics() {
        let none: Vec<Power> = Vec::new();
        let _ = split_by_boundaries(&none, &none, h(12), h(10), false);
    }

    #[test]
    #[should_panic(expected = "non-positive length")]
    fn empty_interval_panics() {
        let left = vec![Power { from: h(10), to: h(10), watts: 1.0 }];
        let none: Vec<Price> = Vec::new();
        let _ = split_by_boundaries(&left, &none, h(9), h(11), false);
    }

    #[test]
    fn overlap_and_hours_helpers() {
        assert_eq!(overlap(h(9), h(11), h(10), h(12)), TimeDelta::hours(1));
        assert_eq!(overlap(h(9), h(10), h(11), h(12)), TimeDelta::zero());
        assert!((hours(TimeDelta::minutes(90)) - 1.5).abs() < 1e-9);
    }
}
