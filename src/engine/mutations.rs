use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::dates;
use crate::limits::*;
use crate::model::*;

use super::availability::AvailabilityChecker;
use super::pricing::{self, PriceQuote};
use super::{CommitScope, Engine, EngineError, RangeRejection, WalCommand};

/// A booking submission exactly as it arrived: every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    /// Verified caller id from the identity provider.
    pub caller: Option<UserId>,
    pub item_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// The total the client displayed. Required, but never trusted.
    pub total_price: Option<String>,
}

/// A request that passed every gate against a snapshot of the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBooking {
    pub renter_id: UserId,
    pub item_id: Ulid,
    pub range: DateRange,
    pub client_total: Money,
    pub quote: PriceQuote,
    /// Clock reading the request was validated against.
    pub now: Timestamp,
}

/// Catalog columns. On listing, `name` and `price_per_day` are required and the
/// rest default; on update, only the `Some` fields change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFields {
    pub name: Option<String>,
    pub item_type: Option<String>,
    pub description: Option<String>,
    pub price_per_day: Option<Money>,
    pub location: Option<String>,
    pub available: Option<bool>,
    pub min_rental_days: Option<u32>,
    pub max_rental_days: Option<u32>,
}

impl ItemFields {
    fn apply_to(self, item: &mut Item) {
        if let Some(v) = self.name {
            item.name = v;
        }
        if let Some(v) = self.item_type {
            item.item_type = Some(v);
        }
        if let Some(v) = self.description {
            item.description = Some(v);
        }
        if let Some(v) = self.price_per_day {
            item.price_per_day = v;
        }
        if let Some(v) = self.location {
            item.location = Some(v);
        }
        if let Some(v) = self.available {
            item.available = v;
        }
        if let Some(v) = self.min_rental_days {
            item.min_rental_days = v;
        }
        if let Some(v) = self.max_rental_days {
            item.max_rental_days = v;
        }
    }
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_item(item: &Item) -> Result<(), EngineError> {
    if item.name.trim().is_empty() {
        return Err(EngineError::InvalidItem("name must not be empty".into()));
    }
    check_len(Some(&item.name), MAX_NAME_LEN, "item name too long")?;
    check_len(item.description.as_deref(), MAX_DESCRIPTION_LEN, "item description too long")?;
    check_len(item.location.as_deref(), MAX_LOCATION_LEN, "item location too long")?;
    check_len(item.item_type.as_deref(), MAX_TYPE_LEN, "item type too long")?;
    if item.price_per_day.is_negative() {
        return Err(EngineError::InvalidItem("price_per_day must not be negative".into()));
    }
    if item.price_per_day.cents() > MAX_PRICE_PER_DAY_CENTS {
        return Err(EngineError::LimitExceeded("price_per_day too large"));
    }
    let (min, max) = (item.min_rental_days, item.max_rental_days);
    if min < 1 || max > MAX_RENTAL_DAYS_CAP || min > max {
        return Err(EngineError::InvalidItem(format!(
            "rental days must satisfy 1 <= min <= max <= {MAX_RENTAL_DAYS_CAP}, got min {min} max {max}"
        )));
    }
    Ok(())
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Engine {
    // ── Users ────────────────────────────────────────────

    /// Create or replace a profile. `created_at` survives replacement.
    pub async fn register_user(
        &self,
        id: UserId,
        name: String,
        contact: Option<String>,
        now: Timestamp,
    ) -> Result<UserProfile, EngineError> {
        let mut missing = Vec::new();
        if id.trim().is_empty() {
            missing.push("id");
        }
        if name.trim().is_empty() {
            missing.push("name");
        }
        if !missing.is_empty() {
            return Err(EngineError::MissingFields(missing));
        }
        check_len(Some(&id), MAX_USER_ID_LEN, "user id too long")?;
        check_len(Some(&name), MAX_NAME_LEN, "user name too long")?;
        check_len(contact.as_deref(), MAX_CONTACT_LEN, "contact too long")?;

        let gate = self.exclusive_gate().await?;
        let created_at = match self.tables.users.get(&id) {
            Some(existing) => existing.created_at,
            None => {
                if self.tables.users.len() >= MAX_USERS {
                    return Err(EngineError::LimitExceeded("too many users"));
                }
                now
            }
        };
        let profile = UserProfile {
            id,
            name,
            contact,
            created_at,
        };
        self.commit(
            CommitScope::new(gate, Vec::new()),
            Event::UserUpserted {
                profile: profile.clone(),
            },
        )
        .await?;
        Ok(profile)
    }

    /// Remove a user with everything they own and every booking they made.
    pub async fn remove_user(&self, id: &str) -> Result<(), EngineError> {
        let gate = self.exclusive_gate().await?;
        if !self.tables.users.contains_key(id) {
            return Err(EngineError::not_found("user", id));
        }
        let event = Event::UserRemoved { id: id.to_string() };
        let guards = self.lock_affected(&event).await?;
        let cascaded = guards.len();
        self.commit(CommitScope::new(gate, guards), event).await?;
        info!("removed user {id} ({cascaded} items affected)");
        Ok(())
    }

    // ── Catalog ──────────────────────────────────────────

    pub async fn list_item(
        &self,
        id: Ulid,
        owner_id: UserId,
        fields: ItemFields,
        now: Timestamp,
    ) -> Result<Item, EngineError> {
        let mut missing = Vec::new();
        if fields.name.as_deref().is_none_or(|n| n.trim().is_empty()) {
            missing.push("name");
        }
        if fields.price_per_day.is_none() {
            missing.push("price_per_day");
        }
        if !missing.is_empty() {
            return Err(EngineError::MissingFields(missing));
        }

        let mut item = Item {
            id,
            owner_id,
            item_type: None,
            name: String::new(),
            description: None,
            price_per_day: Money::ZERO,
            location: None,
            available: true,
            min_rental_days: DEFAULT_MIN_RENTAL_DAYS,
            max_rental_days: DEFAULT_MAX_RENTAL_DAYS,
            created_at: now,
            updated_at: None,
        };
        fields.apply_to(&mut item);
        validate_item(&item)?;

        let gate = self.exclusive_gate().await?;
        if !self.tables.users.contains_key(&item.owner_id) {
            return Err(EngineError::not_found("user", &item.owner_id));
        }
        if self.tables.items.contains_key(&id) {
            return Err(EngineError::AlreadyExists {
                kind: "item",
                id: id.to_string(),
            });
        }
        if self.tables.items.len() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        self.commit(
            CommitScope::new(gate, Vec::new()),
            Event::ItemListed { item: item.clone() },
        )
        .await?;
        Ok(item)
    }

    /// Change catalog fields. Existing bookings are kept as they are.
    pub async fn update_item(
        &self,
        id: Ulid,
        fields: ItemFields,
        now: Timestamp,
    ) -> Result<Item, EngineError> {
        let gate = self.shared_gate().await?;
        let guard = self.lock_item(id).await?;
        let mut item = guard.item.clone();
        fields.apply_to(&mut item);
        item.updated_at = Some(now);
        validate_item(&item)?;

        self.commit(
            CommitScope::new(gate, vec![guard]),
            Event::ItemUpdated { item: item.clone() },
        )
        .await?;
        Ok(item)
    }

    /// Remove an item and all of its bookings.
    pub async fn delist_item(&self, id: Ulid) -> Result<(), EngineError> {
        let gate = self.exclusive_gate().await?;
        let guard = self.lock_item(id).await?;
        let dropped = guard.bookings.len();
        self.commit(CommitScope::new(gate, vec![guard]), Event::ItemDelisted { id })
            .await?;
        info!("delisted item {id} with {dropped} bookings");
        Ok(())
    }

    // ── Booking transaction ──────────────────────────────

    /// Run every gate short of persisting: identity, required fields, date
    /// parsing, item lookup and the availability check against a snapshot.
    pub async fn validate_request(
        &self,
        req: &BookingRequest,
        now: Timestamp,
    ) -> Result<ValidatedBooking, EngineError> {
        let renter_id = present(&req.caller).ok_or(EngineError::Unauthorized)?;

        let item_raw = present(&req.item_id);
        let start_raw = present(&req.start_date);
        let end_raw = present(&req.end_date);
        let client_total = present(&req.total_price)
            .and_then(|s| s.parse::<Money>().ok())
            .filter(|m| !m.is_negative());

        let mut missing = Vec::new();
        for (name, ok) in [
            ("item_id", item_raw.is_some()),
            ("start_date", start_raw.is_some()),
            ("end_date", end_raw.is_some()),
            ("total_price", client_total.is_some()),
        ] {
            if !ok {
                missing.push(name);
            }
        }
        let (Some(item_raw), Some(start_raw), Some(end_raw), Some(client_total)) =
            (item_raw, start_raw, end_raw, client_total)
        else {
            return Err(EngineError::MissingFields(missing));
        };

        let start = dates::parse_day(start_raw).map_err(|e| EngineError::InvalidDate {
            field: "start_date",
            reason: e.to_string(),
        })?;
        let end = dates::parse_day(end_raw).map_err(|e| EngineError::InvalidDate {
            field: "end_date",
            reason: e.to_string(),
        })?;

        let item_id =
            Ulid::from_string(item_raw).map_err(|_| EngineError::not_found("item", item_raw))?;
        let rs = self
            .tables
            .item_state(&item_id)
            .ok_or_else(|| EngineError::not_found("item", item_id))?;
        let guard = self.bounded("item read", rs.read()).await?;
        if !guard.item.available {
            return Err(EngineError::not_found("item", item_id));
        }

        let range = AvailabilityChecker::for_item(&guard, now).validate_range(start, end)?;
        let quote = pricing::quote(guard.item.price_per_day, range.days());

        Ok(ValidatedBooking {
            renter_id: renter_id.to_string(),
            item_id,
            range,
            client_total,
            quote,
            now,
        })
    }

    /// Persist a validated booking. Availability is checked again under the
    /// item's write lock; a range taken since validation is a `Conflict`.
    pub async fn insert_booking(&self, validated: ValidatedBooking) -> Result<Booking, EngineError> {
        let gate = self.shared_gate().await?;
        let guard = self.lock_item(validated.item_id).await?;
        if !guard.item.available {
            return Err(EngineError::not_found("item", validated.item_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many bookings on item"));
        }

        let range = AvailabilityChecker::for_item(&guard, validated.now)
            .validate_range(validated.range.start, validated.range.end)
            .map_err(|rejection| match rejection {
                RangeRejection::Overlap { requested, booking_id } => {
                    EngineError::Conflict { requested, booking_id }
                }
                other => EngineError::Rejected(other),
            })?;

        let quote = pricing::quote(guard.item.price_per_day, range.days());
        if quote.total != validated.client_total {
            warn!(
                "client total {} differs from computed {} for item {}; storing computed",
                validated.client_total, quote.total, validated.item_id
            );
        }

        let booking = Booking {
            id: Ulid::new(),
            item_id: validated.item_id,
            renter_id: validated.renter_id,
            range,
            total_price: quote.total,
            status: BookingStatus::Pending,
            created_at: validated.now,
        };
        self.commit(
            CommitScope::new(gate, vec![guard]),
            Event::BookingCreated {
                booking: booking.clone(),
            },
        )
        .await
        .map_err(|e| match e {
            EngineError::Transient(msg) => {
                warn!("booking {} on item {} may still land: {msg}", booking.id, booking.item_id);
                EngineError::Transient(format!("{msg}; booking {} may still be recorded", booking.id))
            }
            other => other,
        })?;
        Ok(booking)
    }

    /// Received → Authenticated → Validated → Persisted, or rejected at a gate.
    pub async fn create_booking(
        &self,
        req: &BookingRequest,
        now: Timestamp,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = match self.validate_request(req, now).await {
            Ok(validated) => self.insert_booking(validated).await,
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.reason(),
        };
        metrics::counter!(crate::observability::BOOKING_ATTEMPTS_TOTAL, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(crate::observability::BOOKING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(b) => info!(
                "booking {} created on item {} for {} ({} days, total {})",
                b.id,
                b.item_id,
                b.range,
                b.range.days(),
                b.total_price
            ),
            Err(e) if e.is_retryable() => warn!("booking attempt failed transiently: {e}"),
            Err(e) => debug!("booking rejected: {}: {e}", e.reason()),
        }
        result
    }

    /// Administrative status change. Cancelling frees the booked range.
    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let gate = self.shared_gate().await?;
        let item_id = self
            .tables
            .booking_to_item
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let guard = self.lock_item(item_id).await?;
        let mut booking = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;

        if !booking.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: status,
            });
        }

        self.commit(
            CommitScope::new(gate, vec![guard]),
            Event::BookingStatusChanged { id, item_id, status },
        )
        .await?;
        info!("booking {id}: {} -> {status}", booking.status);
        booking.status = status;
        Ok(booking)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    /// Holds the gate exclusively so no commit can slip between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.exclusive_gate().await?;

        let mut events: Vec<Event> = self
            .tables
            .users
            .iter()
            .map(|e| Event::UserUpserted {
                profile: e.value().clone(),
            })
            .collect();

        for rs in self.tables.all_item_states() {
            let guard = rs.read().await;
            events.push(Event::ItemListed {
                item: guard.item.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transient(format!("WAL compaction failed: {e}")))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
