use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::dates;

/// A UTC calendar day.
pub type Day = NaiveDate;

/// An absolute instant. The only instant type in the core; epoch seconds and
/// display strings are derived from it at the query edge.
pub type Timestamp = DateTime<Utc>;

/// Opaque caller id handed over by the identity provider.
pub type UserId = String;

pub const DEFAULT_MIN_RENTAL_DAYS: u32 = 1;
pub const DEFAULT_MAX_RENTAL_DAYS: u32 = 30;

// ── Money ────────────────────────────────────────────────────────

/// An amount in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn times(self, n: i64) -> Self {
        Self(self.0 * n)
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    /// Accepts `45`, `45.5`, `45.50`, `-3.10`. More than two decimals is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MoneyParseError(s.to_string()));
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MoneyParseError(s.to_string()));
        }
        let units: i64 = whole.parse().map_err(|_| MoneyParseError(s.to_string()))?;
        let cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| MoneyParseError(s.to_string()))? * 10,
            _ => frac.parse().map_err(|_| MoneyParseError(s.to_string()))?,
        };
        let total = units
            .checked_mul(100)
            .and_then(|u| u.checked_add(cents))
            .ok_or_else(|| MoneyParseError(s.to_string()))?;
        Ok(Money(if negative { -total } else { total }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount: {0}")]
pub struct MoneyParseError(pub String);

// ── Date ranges ──────────────────────────────────────────────────

/// Half-open range of days `[start, end)`: the nights a booking occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Day,
    pub end: Day,
}

impl DateRange {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: Day, end: Day) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        dates::days_between(self.start, self.end)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        dates::overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_day(&self, day: Day) -> bool {
        self.start <= day && day < self.end
    }

    /// Every occupied day, `start` through the day before `end`.
    pub fn nights(&self) -> impl Iterator<Item = Day> {
        self.start.iter_days().take_while({
            let end = self.end;
            move |d| *d < end
        })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Booking status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 4] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Cancelled,
        BookingStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    /// Holds its date range. Only cancelled bookings release their days.
    pub fn occupies(self) -> bool {
        self != BookingStatus::Cancelled
    }

    /// Administrative transitions. `cancelled` and `completed` are terminal.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        BookingStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == lower)
            .ok_or_else(|| StatusParseError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown booking status: {0} (expected pending, confirmed, cancelled or completed)")]
pub struct StatusParseError(pub String);

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub contact: Option<String>,
    pub created_at: Timestamp,
}

/// A rentable piece of gear, as the catalog supplies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Ulid,
    pub owner_id: UserId,
    pub item_type: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub price_per_day: Money,
    pub location: Option<String>,
    pub available: bool,
    pub min_rental_days: u32,
    pub max_rental_days: u32,
    pub created_at: Timestamp,
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub item_id: Ulid,
    pub renter_id: UserId,
    pub range: DateRange,
    pub total_price: Money,
    pub status: BookingStatus,
    pub created_at: Timestamp,
}

/// An item plus every booking ever made on it, sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub item: Item,
    pub bookings: Vec<Booking>,
}

impl ItemState {
    pub fn new(item: Item) -> Self {
        Self {
            item,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by range.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose range intersects `query`, cancelled ones included.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }
}

/// WAL record. One per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserUpserted { profile: UserProfile },
    UserRemoved { id: UserId },
    ItemListed { item: Item },
    ItemUpdated { item: Item },
    ItemDelisted { id: Ulid },
    BookingCreated { booking: Booking },
    BookingStatusChanged {
        id: Ulid,
        item_id: Ulid,
        status: BookingStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Read-only item snapshot joined onto a booking at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSnapshot {
    pub id: Ulid,
    pub name: String,
    pub item_type: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub price_per_day: String,
    pub owner_id: UserId,
}

impl From<&Item> for ItemSnapshot {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            item_type: item.item_type.clone(),
            description: item.description.clone(),
            location: item.location.clone(),
            price_per_day: item.price_per_day.to_string(),
            owner_id: item.owner_id.clone(),
        }
    }
}

/// Public part of the owner's profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerProfile {
    pub id: UserId,
    pub name: String,
    pub contact: Option<String>,
}

impl From<&UserProfile> for OwnerProfile {
    fn from(p: &UserProfile) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            contact: p.contact.clone(),
        }
    }
}

/// A booking joined with its item and owner, with instants already converted
/// to every form the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub days: i64,
    pub start_display: String,
    pub end_display: String,
    pub created_at_unix: i64,
    pub created_at_display: String,
    pub item: ItemSnapshot,
    pub owner: Option<OwnerProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayoutSummary {
    pub owner_id: UserId,
    pub pending_bookings: usize,
    pub confirmed_bookings: usize,
    pub completed_bookings: usize,
    pub cancelled_bookings: usize,
    /// Sum of confirmed totals: money that will be earned once rentals complete.
    pub pending_revenue: Money,
    pub completed_revenue: Money,
    pub platform_fee: Money,
    pub available_for_payout: Money,
}
