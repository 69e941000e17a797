use chrono::Days;
use ulid::Ulid;

use crate::dates;
use crate::model::*;

use super::error::RangeRejection;

/// Per-item rental bounds, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RentalTerms {
    pub min_rental_days: u32,
    pub max_rental_days: u32,
}

impl Default for RentalTerms {
    fn default() -> Self {
        Self {
            min_rental_days: DEFAULT_MIN_RENTAL_DAYS,
            max_rental_days: DEFAULT_MAX_RENTAL_DAYS,
        }
    }
}

impl From<&Item> for RentalTerms {
    fn from(item: &Item) -> Self {
        Self {
            min_rental_days: item.min_rental_days,
            max_rental_days: item.max_rental_days,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupiedRange {
    pub booking_id: Ulid,
    pub range: DateRange,
}

/// Decides which days are bookable for one item.
///
/// Pure: works off the bookings snapshot and the clock reading it is built with,
/// so the same inputs always give the same answers.
#[derive(Debug, Clone)]
pub struct AvailabilityChecker {
    terms: RentalTerms,
    /// Occupying bookings, sorted by range start.
    occupied: Vec<OccupiedRange>,
    today: Day,
}

impl AvailabilityChecker {
    /// Cancelled bookings in `bookings` are ignored.
    pub fn new<'a>(
        terms: RentalTerms,
        bookings: impl IntoIterator<Item = &'a Booking>,
        now: Timestamp,
    ) -> Self {
        let mut occupied: Vec<OccupiedRange> = bookings
            .into_iter()
            .filter(|b| b.status.occupies())
            .map(|b| OccupiedRange {
                booking_id: b.id,
                range: b.range,
            })
            .collect();
        occupied.sort_by_key(|o| o.range.start);
        Self {
            terms,
            occupied,
            today: dates::today(now),
        }
    }

    pub fn for_item(state: &ItemState, now: Timestamp) -> Self {
        Self::new(RentalTerms::from(&state.item), &state.bookings, now)
    }

    pub fn terms(&self) -> RentalTerms {
        self.terms
    }

    /// Past days and every night held by an occupying booking.
    pub fn is_date_disabled(&self, day: Day) -> bool {
        day < self.today || self.occupied.iter().any(|o| o.range.contains_day(day))
    }

    /// Every disabled day in `[from, to)`, ascending.
    pub fn disabled_dates(&self, from: Day, to: Day) -> Vec<Day> {
        let Some(window) = DateRange::try_new(from, to) else {
            return Vec::new();
        };
        let blocked = merge_ranges(
            &self
                .occupied
                .iter()
                .map(|o| o.range)
                .filter(|r| r.overlaps(&window))
                .collect::<Vec<_>>(),
        );

        let mut out = Vec::new();
        let mut bi = 0;
        for day in window.nights() {
            while bi < blocked.len() && blocked[bi].end <= day {
                bi += 1;
            }
            let in_booking = blocked.get(bi).is_some_and(|r| r.contains_day(day));
            if day < self.today || in_booking {
                out.push(day);
            }
        }
        out
    }

    /// Every check that fails for `[start, end)`, in tie-break order.
    /// Duration checks only run when the range is well ordered.
    pub fn violations(&self, start: Day, end: Day) -> Vec<RangeRejection> {
        let mut found = Vec::new();

        if start < self.today {
            found.push(RangeRejection::PastDate { start });
        }

        let Some(requested) = DateRange::try_new(start, end) else {
            found.push(RangeRejection::InvalidOrder { start, end });
            return found;
        };

        if let Some(hit) = self.first_overlap(&requested) {
            found.push(RangeRejection::Overlap {
                requested,
                booking_id: hit.booking_id,
            });
        }

        let days = requested.days();
        if days < i64::from(self.terms.min_rental_days) {
            found.push(RangeRejection::TooShort {
                min: self.terms.min_rental_days,
                days,
            });
        }
        if days > i64::from(self.terms.max_rental_days) {
            found.push(RangeRejection::TooLong {
                max: self.terms.max_rental_days,
                days,
            });
        }
        found
    }

    /// The bookable range, or the first failing check.
    pub fn validate_range(&self, start: Day, end: Day) -> Result<DateRange, RangeRejection> {
        match self.violations(start, end).into_iter().next() {
            Some(rejection) => Err(rejection),
            None => Ok(DateRange::new(start, end)),
        }
    }

    /// Earliest-starting occupying booking that intersects `range`.
    pub fn first_overlap(&self, range: &DateRange) -> Option<OccupiedRange> {
        let right_bound = self
            .occupied
            .partition_point(|o| o.range.start < range.end);
        self.occupied[..right_bound]
            .iter()
            .find(|o| o.range.end > range.start)
            .copied()
    }

    /// Last day a stay starting on `start` may end on, per `max_rental_days`.
    pub fn latest_end(&self, start: Day) -> Option<Day> {
        start.checked_add_days(Days::new(u64::from(self.terms.max_rental_days)))
    }
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_ranges(sorted: &[DateRange]) -> Vec<DateRange> {
    let mut merged: Vec<DateRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> Day {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// 2024-06-10 at noon UTC.
    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn booking(start: Day, end: Day, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            item_id: Ulid::nil(),
            renter_id: "renter".into(),
            range: DateRange::new(start, end),
            total_price: Money::ZERO,
            status,
            created_at: now(),
        }
    }

    fn terms(min: u32, max: u32) -> RentalTerms {
        RentalTerms {
            min_rental_days: min,
            max_rental_days: max,
        }
    }

    #[test]
    fn free_item_accepts_range() {
        let checker = AvailabilityChecker::new(RentalTerms::default(), &[], now());
        let r = checker.validate_range(d(2024, 6, 12), d(2024, 6, 14)).unwrap();
        assert_eq!(r.days(), 2);
    }

    #[test]
    fn today_is_bookable_yesterday_is_not() {
        let checker = AvailabilityChecker::new(RentalTerms::default(), &[], now());
        assert!(checker.validate_range(d(2024, 6, 10), d(2024, 6, 11)).is_ok());
        assert_eq!(
            checker.validate_range(d(2024, 6, 9), d(2024, 6, 11)),
            Err(RangeRejection::PastDate { start: d(2024, 6, 9) })
        );
    }

    #[test]
    fn start_equal_end_is_invalid_order() {
        let checker = AvailabilityChecker::new(RentalTerms::default(), &[], now());
        assert_eq!(
            checker.validate_range(d(2024, 6, 12), d(2024, 6, 12)),
            Err(RangeRejection::InvalidOrder { start: d(2024, 6, 12), end: d(2024, 6, 12) })
        );
    }

    #[test]
    fn overlap_reports_conflicting_booking() {
        let existing = booking(d(2024, 6, 15), d(2024, 6, 18), BookingStatus::Confirmed);
        let id = existing.id;
        let checker = AvailabilityChecker::new(RentalTerms::default(), [&existing], now());
        match checker.validate_range(d(2024, 6, 17), d(2024, 6, 20)) {
            Err(RangeRejection::Overlap { booking_id, .. }) => assert_eq!(booking_id, id),
            other => panic!("expected Overlap, got {other:?}"),
        }
    }

    #[test]
    fn back_to_back_is_allowed() {
        let existing = booking(d(2024, 6, 15), d(2024, 6, 18), BookingStatus::Pending);
        let checker = AvailabilityChecker::new(RentalTerms::default(), [&existing], now());
        assert!(checker.validate_range(d(2024, 6, 18), d(2024, 6, 20)).is_ok());
        assert!(checker.validate_range(d(2024, 6, 12), d(2024, 6, 15)).is_ok());
    }

    #[test]
    fn cancelled_bookings_free_their_days() {
        let existing = booking(d(2024, 6, 15), d(2024, 6, 18), BookingStatus::Cancelled);
        let checker = AvailabilityChecker::new(RentalTerms::default(), [&existing], now());
        assert!(checker.validate_range(d(2024, 6, 15), d(2024, 6, 18)).is_ok());
        assert!(!checker.is_date_disabled(d(2024, 6, 16)));
    }

    #[test]
    fn completed_bookings_still_occupy() {
        let existing = booking(d(2024, 6, 15), d(2024, 6, 18), BookingStatus::Completed);
        let checker = AvailabilityChecker::new(RentalTerms::default(), [&existing], now());
        assert!(checker.is_date_disabled(d(2024, 6, 15)));
    }

    #[test]
    fn eight_days_on_seven_day_max_is_too_long() {
        let checker = AvailabilityChecker::new(terms(1, 7), &[], now());
        assert_eq!(
            checker.validate_range(d(2024, 6, 12), d(2024, 6, 20)),
            Err(RangeRejection::TooLong { max: 7, days: 8 })
        );
        assert!(checker.validate_range(d(2024, 6, 12), d(2024, 6, 19)).is_ok());
    }

    #[test]
    fn below_minimum_is_too_short() {
        let checker = AvailabilityChecker::new(terms(3, 7), &[], now());
        assert_eq!(
            checker.validate_range(d(2024, 6, 12), d(2024, 6, 14)),
            Err(RangeRejection::TooShort { min: 3, days: 2 })
        );
    }

    #[test]
    fn earliest_check_wins_tie_break() {
        let existing = booking(d(2024, 6, 8), d(2024, 6, 12), BookingStatus::Pending);
        let checker = AvailabilityChecker::new(terms(5, 7), [&existing], now());

        // Past, overlapping and too short all at once.
        let all = checker.violations(d(2024, 6, 9), d(2024, 6, 11));
        let reasons: Vec<_> = all.iter().map(|r| r.reason()).collect();
        assert_eq!(reasons, vec!["PastDate", "Overlap", "TooShort"]);
        assert_eq!(
            checker.validate_range(d(2024, 6, 9), d(2024, 6, 11)).unwrap_err().reason(),
            "PastDate"
        );

        // Overlap beats TooShort.
        assert_eq!(
            checker.validate_range(d(2024, 6, 11), d(2024, 6, 13)).unwrap_err().reason(),
            "Overlap"
        );
    }

    #[test]
    fn invalid_order_skips_duration_checks() {
        let checker = AvailabilityChecker::new(terms(2, 7), &[], now());
        let reasons: Vec<_> = checker
            .violations(d(2024, 6, 14), d(2024, 6, 12))
            .iter()
            .map(|r| r.reason())
            .collect();
        assert_eq!(reasons, vec!["InvalidOrder"]);
    }

    #[test]
    fn date_disabled_for_past_and_occupied_nights() {
        let existing = booking(d(2024, 6, 15), d(2024, 6, 17), BookingStatus::Pending);
        let checker = AvailabilityChecker::new(RentalTerms::default(), [&existing], now());
        assert!(checker.is_date_disabled(d(2024, 6, 9)));
        assert!(!checker.is_date_disabled(d(2024, 6, 10)));
        assert!(checker.is_date_disabled(d(2024, 6, 15)));
        assert!(checker.is_date_disabled(d(2024, 6, 16)));
        assert!(!checker.is_date_disabled(d(2024, 6, 17))); // checkout day
    }

    #[test]
    fn disabled_dates_window() {
        let a = booking(d(2024, 6, 12), d(2024, 6, 14), BookingStatus::Pending);
        let b = booking(d(2024, 6, 14), d(2024, 6, 15), BookingStatus::Confirmed);
        let checker = AvailabilityChecker::new(RentalTerms::default(), [&a, &b], now());
        let days = checker.disabled_dates(d(2024, 6, 8), d(2024, 6, 17));
        assert_eq!(
            days,
            vec![
                d(2024, 6, 8),
                d(2024, 6, 9),
                d(2024, 6, 12),
                d(2024, 6, 13),
                d(2024, 6, 14),
            ]
        );
    }

    #[test]
    fn disabled_dates_empty_window() {
        let checker = AvailabilityChecker::new(RentalTerms::default(), &[], now());
        assert!(checker.disabled_dates(d(2024, 6, 20), d(2024, 6, 20)).is_empty());
    }

    #[test]
    fn merge_ranges_joins_touching() {
        let merged = merge_ranges(&[
            DateRange::new(d(2024, 1, 1), d(2024, 1, 3)),
            DateRange::new(d(2024, 1, 3), d(2024, 1, 5)),
            DateRange::new(d(2024, 1, 7), d(2024, 1, 8)),
        ]);
        assert_eq!(
            merged,
            vec![
                DateRange::new(d(2024, 1, 1), d(2024, 1, 5)),
                DateRange::new(d(2024, 1, 7), d(2024, 1, 8)),
            ]
        );
    }

    #[test]
    fn latest_end_follows_max() {
        let checker = AvailabilityChecker::new(terms(1, 7), &[], now());
        assert_eq!(checker.latest_end(d(2024, 6, 12)), Some(d(2024, 6, 19)));
    }

    proptest! {
        #[test]
        fn validate_range_is_idempotent(
            s in 0i64..60,
            len in -3i64..40,
            existing in proptest::collection::vec((0i64..60, 1i64..10), 0..6),
        ) {
            let base = d(2024, 6, 1);
            let bookings: Vec<Booking> = existing
                .iter()
                .map(|(o, l)| {
                    let start = base + chrono::Duration::days(*o);
                    booking(start, start + chrono::Duration::days(*l), BookingStatus::Pending)
                })
                .collect();
            let checker = AvailabilityChecker::new(terms(2, 14), &bookings, now());
            let start = base + chrono::Duration::days(s);
            let end = start + chrono::Duration::days(len);
            prop_assert_eq!(checker.validate_range(start, end), checker.validate_range(start, end));
        }

        #[test]
        fn accepted_range_never_overlaps_snapshot(
            s in 0i64..60,
            len in 1i64..14,
            existing in proptest::collection::vec((0i64..60, 1i64..10), 0..6),
        ) {
            let base = d(2024, 6, 10);
            let bookings: Vec<Booking> = existing
                .iter()
                .map(|(o, l)| {
                    let start = base + chrono::Duration::days(*o);
                    booking(start, start + chrono::Duration::days(*l), BookingStatus::Confirmed)
                })
                .collect();
            let checker = AvailabilityChecker::new(RentalTerms::default(), &bookings, now());
            let start = base + chrono::Duration::days(s);
            let end = start + chrono::Duration::days(len);
            if let Ok(range) = checker.validate_range(start, end) {
                prop_assert!(bookings.iter().all(|b| !b.range.overlaps(&range)));
            }
        }
    }
}
