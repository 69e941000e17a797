//! Hard caps on inputs. Anything past these is rejected before it reaches the WAL.

pub const MAX_ITEMS: usize = 100_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_BOOKINGS_PER_ITEM: usize = 10_000;

pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 1024;
pub const MAX_LOCATION_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 512;
pub const MAX_TYPE_LEN: usize = 64;

/// Upper bound for an item's `max_rental_days`.
pub const MAX_RENTAL_DAYS_CAP: u32 = 365;

/// Widest window `disabled_dates` will enumerate.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

/// Largest accepted `price_per_day`, in cents.
pub const MAX_PRICE_PER_DAY_CENTS: i64 = 100_000_000;

/// Calendar dates outside this year range are rejected as invalid.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2199;

/// Largest WAL payload. Every event is a single small record.
pub const MAX_WAL_FRAME_LEN: usize = 1 << 20;
