//! Line-item pricing with quantity-gated percentage offers.
//!
//! All amounts are integer minor currency units. Pricing never fails: an
//! offer that does not apply is reported in [`LinePrice::rejected`] and the
//! line falls back to the undiscounted base price.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The parts of an offer that pricing cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferTerms {
    pub offer_id: Uuid,
    pub product_id: Uuid,
    pub discount_percent: i32,
    pub min_quantity: i32,
    pub active: bool,
}

/// Why a requested offer was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferRejection {
    Inactive,
    ProductMismatch,
    BelowMinQuantity,
    InvalidPercent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePrice {
    pub base_unit_price: i64,
    pub unit_price: i64,
    pub line_total: i64,
    /// Set only when the offer was applied
    pub discount_percent: Option<i32>,
    pub rejected: Option<OfferRejection>,
}

/// `round(base_price * (100 - discount_percent) / 100)`, half away from zero.
pub fn discounted_unit_price(base_price: i64, discount_percent: i32) -> i64 {
    let pct = discount_percent.clamp(0, 100);
    let price = Decimal::from(base_price) * Decimal::from(100 - pct) / Decimal::from(100);
    price
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(base_price)
}

/// Checks whether `offer` may discount `quantity` units of `product_id`.
pub fn check_offer(
    product_id: Uuid,
    offer: &OfferTerms,
    quantity: i32,
) -> Result<(), OfferRejection> {
    if !offer.active {
        return Err(OfferRejection::Inactive);
    }
    if offer.product_id != product_id {
        return Err(OfferRejection::ProductMismatch);
    }
    if !(0..=100).contains(&offer.discount_percent) {
        return Err(OfferRejection::InvalidPercent);
    }
    if quantity < offer.min_quantity {
        return Err(OfferRejection::BelowMinQuantity);
    }
    Ok(())
}

/// Prices one cart line.
pub fn price_line(
    product_id: Uuid,
    base_price: i64,
    offer: Option<&OfferTerms>,
    quantity: i32,
) -> LinePrice {
    let base_unit_price = base_price.max(0);
    let quantity = i64::from(quantity.max(0));

    let (unit_price, discount_percent, rejected) = match offer {
        None => (base_unit_price, None, None),
        Some(terms) => match check_offer(product_id, terms, quantity as i32) {
            Ok(()) => (
                discounted_unit_price(base_unit_price, terms.discount_percent),
                Some(terms.discount_percent),
                None,
            ),
            Err(reason) => (base_unit_price, None, Some(reason)),
        },
    };

    LinePrice {
        base_unit_price,
        unit_price,
        line_total: unit_price.saturating_mul(quantity),
        discount_percent,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(product_id: Uuid, pct: i32, min_qty: i32) -> OfferTerms {
        OfferTerms {
            offer_id: Uuid::new_v4(),
            product_id,
            discount_percent: pct,
            min_quantity: min_qty,
            active: true,
        }
    }

    #[test]
    fn no_offer_uses_base_price() {
        let p = Uuid::new_v4();
        let price = price_line(p, 459, None, 2);
        assert_eq!(price.unit_price, 459);
        assert_eq!(price.line_total, 918);
        assert_eq!(price.discount_percent, None);
        assert_eq!(price.rejected, None);
    }

    #[test]
    fn offer_applies_at_min_quantity() {
        let p = Uuid::new_v4();
        let price = price_line(p, 459, Some(&offer(p, 10, 2)), 2);
        // 459 * 0.9 = 413.1
        assert_eq!(price.unit_price, 413);
        assert_eq!(price.line_total, 826);
        assert_eq!(price.discount_percent, Some(10));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        // 25 * 0.9 = 22.5
        assert_eq!(discounted_unit_price(25, 10), 23);
        // 15 * 0.5 = 7.5
        assert_eq!(discounted_unit_price(15, 50), 8);
        assert_eq!(discounted_unit_price(999, 0), 999);
        assert_eq!(discounted_unit_price(999, 100), 0);
    }

    #[test]
    fn offer_below_min_quantity_falls_back() {
        let p = Uuid::new_v4();
        let price = price_line(p, 500, Some(&offer(p, 20, 3)), 2);
        assert_eq!(price.unit_price, 500);
        assert_eq!(price.rejected, Some(OfferRejection::BelowMinQuantity));
    }

    #[test]
    fn offer_for_other_product_falls_back() {
        let p = Uuid::new_v4();
        let price = price_line(p, 500, Some(&offer(Uuid::new_v4(), 20, 1)), 1);
        assert_eq!(price.unit_price, 500);
        assert_eq!(price.rejected, Some(OfferRejection::ProductMismatch));
    }

    #[test]
    fn inactive_or_out_of_range_offer_falls_back() {
        let p = Uuid::new_v4();
        let mut inactive = offer(p, 20, 1);
        inactive.active = false;
        assert_eq!(
            price_line(p, 500, Some(&inactive), 1).rejected,
            Some(OfferRejection::Inactive)
        );
        assert_eq!(
            price_line(p, 500, Some(&offer(p, 120, 1)), 1).rejected,
            Some(OfferRejection::InvalidPercent)
        );
    }
}
