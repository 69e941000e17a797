use ulid::Ulid;

use crate::dates;
use crate::limits::*;
use crate::model::*;

use super::availability::AvailabilityChecker;
use super::pricing::{self, PriceQuote};
use super::{Engine, EngineError, RangeRejection, SharedItemState};

/// Outcome of checking a range for a date picker: every violated check, and a
/// price breakdown whenever the range is well ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCheck {
    pub violations: Vec<RangeRejection>,
    pub quote: Option<PriceQuote>,
}

impl RangeCheck {
    pub fn is_bookable(&self) -> bool {
        self.violations.is_empty()
    }

    /// The single reason reported when several checks fail.
    pub fn reason(&self) -> Option<&RangeRejection> {
        self.violations.first()
    }
}

impl Engine {
    fn item_state(&self, id: &Ulid) -> Result<SharedItemState, EngineError> {
        self.tables
            .item_state(id)
            .ok_or_else(|| EngineError::not_found("item", id))
    }

    pub fn get_user(&self, id: &str) -> Result<UserProfile, EngineError> {
        self.tables
            .users
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("user", id))
    }

    pub async fn get_item(&self, id: Ulid) -> Result<Item, EngineError> {
        let rs = self.item_state(&id)?;
        let guard = self.bounded("item read", rs.read()).await?;
        Ok(guard.item.clone())
    }

    /// Items in the catalog, oldest listing first.
    pub async fn list_items(&self, owner_id: Option<&str>) -> Result<Vec<Item>, EngineError> {
        let mut items = Vec::new();
        for rs in self.tables.all_item_states() {
            let guard = self.bounded("item read", rs.read()).await?;
            if owner_id.is_none_or(|o| guard.item.owner_id == o) {
                items.push(guard.item.clone());
            }
        }
        items.sort_by_key(|i| (i.created_at, i.id));
        Ok(items)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let item_id = self
            .tables
            .booking_to_item
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let rs = self.item_state(&item_id)?;
        let guard = self.bounded("item read", rs.read()).await?;
        guard
            .booking(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    /// A booking joined with its item and owner as they are right now.
    pub async fn get_booking_view(&self, id: Ulid) -> Result<BookingView, EngineError> {
        let booking = self.get_booking(id).await?;
        let item = self.get_item(booking.item_id).await?;
        let owner = self
            .tables
            .users
            .get(&item.owner_id)
            .map(|e| OwnerProfile::from(e.value()));

        Ok(BookingView {
            days: booking.range.days(),
            start_display: dates::display_day(booking.range.start),
            end_display: dates::display_day(booking.range.end),
            created_at_unix: booking.created_at.timestamp(),
            created_at_display: dates::display_instant(booking.created_at),
            item: ItemSnapshot::from(&item),
            owner,
            booking,
        })
    }

    /// Bookings on an item, sorted by start date, minus the excluded statuses.
    /// An unknown item has no bookings.
    pub async fn list_bookings_for_item(
        &self,
        item_id: Ulid,
        exclude: &[BookingStatus],
    ) -> Result<Vec<Booking>, EngineError> {
        let Some(rs) = self.tables.item_state(&item_id) else {
            return Ok(Vec::new());
        };
        let guard = self.bounded("item read", rs.read()).await?;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| !exclude.contains(&b.status))
            .cloned()
            .collect())
    }

    /// Days in `[from, to)` a date picker must grey out.
    pub async fn disabled_dates(
        &self,
        item_id: Ulid,
        from: Day,
        to: Day,
        now: Timestamp,
    ) -> Result<Vec<Day>, EngineError> {
        if dates::days_between(from, to) > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("disabled_dates window too large"));
        }
        let rs = self.item_state(&item_id)?;
        let guard = self.bounded("item read", rs.read()).await?;
        Ok(AvailabilityChecker::for_item(&guard, now).disabled_dates(from, to))
    }

    /// Run every range check and price the stay, without booking anything.
    pub async fn quote(
        &self,
        item_id: Ulid,
        start: Day,
        end: Day,
        now: Timestamp,
    ) -> Result<RangeCheck, EngineError> {
        let rs = self.item_state(&item_id)?;
        let guard = self.bounded("item read", rs.read()).await?;
        let violations = AvailabilityChecker::for_item(&guard, now).violations(start, end);
        let quote = DateRange::try_new(start, end)
            .map(|r| pricing::quote(guard.item.price_per_day, r.days()));
        Ok(RangeCheck { violations, quote })
    }

    /// Revenue summary across every item `owner_id` lists.
    pub async fn owner_payouts(&self, owner_id: &str) -> Result<PayoutSummary, EngineError> {
        if !self.tables.users.contains_key(owner_id) {
            return Err(EngineError::not_found("user", owner_id));
        }
        let mut summary = PayoutSummary {
            owner_id: owner_id.to_string(),
            ..Default::default()
        };

        for rs in self.tables.all_item_states() {
            let guard = self.bounded("item read", rs.read()).await?;
            if guard.item.owner_id != owner_id {
                continue;
            }
            for b in &guard.bookings {
                match b.status {
                    BookingStatus::Pending => summary.pending_bookings += 1,
                    BookingStatus::Confirmed => {
                        summary.confirmed_bookings += 1;
                        summary.pending_revenue = summary.pending_revenue + b.total_price;
                    }
                    BookingStatus::Completed => {
                        summary.completed_bookings += 1;
                        summary.completed_revenue = summary.completed_revenue + b.total_price;
                        summary.platform_fee = summary.platform_fee + pricing::fee(b.total_price);
                    }
                    BookingStatus::Cancelled => summary.cancelled_bookings += 1,
                }
            }
        }
        summary.available_for_payout = summary.completed_revenue - summary.platform_fee;
        Ok(summary)
    }
}
