use serde::Serialize;

use crate::model::Money;

/// Platform service fee, in basis points of the rental subtotal.
pub const SERVICE_FEE_BPS: i64 = 1_500;

/// Breakdown shown to a renter before booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub price_per_day: Money,
    pub days: i64,
    pub subtotal: Money,
    pub service_fee: Money,
    pub total: Money,
}

/// `subtotal = price_per_day * days`, fee at 15% rounded half-up to the cent.
/// `days` is whatever the checker accepted; non-positive durations never get here.
pub fn quote(price_per_day: Money, days: i64) -> PriceQuote {
    let subtotal = price_per_day.times(days);
    let service_fee = fee(subtotal);
    PriceQuote {
        price_per_day,
        days,
        subtotal,
        service_fee,
        total: subtotal + service_fee,
    }
}

/// Platform share of `amount`, rounded half-up to the cent.
pub fn fee(amount: Money) -> Money {
    let cents = amount.cents();
    let scaled = cents * SERVICE_FEE_BPS;
    let rounded = if scaled >= 0 {
        (scaled + 5_000) / 10_000
    } else {
        -((-scaled + 5_000) / 10_000)
    };
    Money::from_cents(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn two_days_at_45() {
        let q = quote(Money::from_units(45), 2);
        assert_eq!(q.subtotal.to_string(), "90.00");
        assert_eq!(q.service_fee.to_string(), "13.50");
        assert_eq!(q.total.to_string(), "103.50");
    }

    #[test]
    fn fee_rounds_half_up() {
        // 0.15 * 0.10 = 0.015 -> 0.02
        assert_eq!(fee(Money::from_cents(10)), Money::from_cents(2));
        // 0.15 * 0.03 = 0.0045 -> 0.00
        assert_eq!(fee(Money::from_cents(3)), Money::ZERO);
        // 0.15 * 33.33 = 4.9995 -> 5.00
        assert_eq!(fee(Money::from_cents(3333)), Money::from_cents(500));
    }

    #[test]
    fn total_is_subtotal_plus_fee() {
        for (price, days) in [(1, 1), (1999, 3), (12_345, 30), (7, 365)] {
            let q = quote(Money::from_cents(price), days);
            assert_eq!(q.total, q.subtotal + q.service_fee);
            assert_eq!(q.subtotal, Money::from_cents(price * days));
        }
    }

    #[test]
    fn free_item_costs_nothing() {
        let q = quote(Money::ZERO, 5);
        assert_eq!(q.total, Money::ZERO);
    }

    proptest! {
        #[test]
        fn quote_identity(price in 0i64..=100_000_000, days in 1i64..=365) {
            let q = quote(Money::from_cents(price), days);
            prop_assert_eq!(q.subtotal.cents(), price * days);
            prop_assert_eq!(q.total, q.subtotal + q.service_fee);
            // Half-up rounding never strays more than half a cent from 15%.
            let exact_x2 = q.subtotal.cents() * 3;
            let fee_x20 = q.service_fee.cents() * 20;
            prop_assert!((fee_x20 - exact_x2).abs() <= 10);
        }
    }
}
