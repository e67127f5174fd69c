//! Shippable weight from human-entered size tokens, and package tier lookup.
//!
//! Item weight is the sum of `parsed size * quantity` over all lines. Sizes
//! that cannot be parsed count as [`DEFAULT_ITEM_GRAMS`]. The package tier is
//! chosen from the item weight; the shipped weight adds the tier's packaging,
//! is floored at [`MIN_SHIPPED_GRAMS`] and rounded up to a whole gram.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_ITEM_GRAMS: i64 = 500;
pub const MIN_SHIPPED_GRAMS: i64 = 100;

static SIZE_TOKEN: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*(kgs?|kilograms?|g|gm|gms|grams?)?\s*$")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub length_cm: i32,
    pub breadth_cm: i32,
    pub height_cm: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageTier {
    P1,
    P2,
    P3,
}

impl PackageTier {
    pub fn for_item_weight(item_grams: Decimal) -> Self {
        if item_grams <= Decimal::from(280) {
            PackageTier::P1
        } else if item_grams <= Decimal::from(490) {
            PackageTier::P2
        } else {
            PackageTier::P3
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            PackageTier::P1 => "p1",
            PackageTier::P2 => "p2",
            PackageTier::P3 => "p3",
        }
    }

    pub fn packaging_grams(self) -> i64 {
        match self {
            PackageTier::P1 => 53,
            PackageTier::P2 => 70,
            PackageTier::P3 => 110,
        }
    }

    pub fn dimensions(self) -> Dimensions {
        let (length_cm, breadth_cm, height_cm) = match self {
            PackageTier::P1 => (15, 10, 8),
            PackageTier::P2 => (20, 15, 10),
            PackageTier::P3 => (25, 20, 15),
        };
        Dimensions {
            length_cm,
            breadth_cm,
            height_cm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSelection {
    pub tier: PackageTier,
    pub item_grams: Decimal,
    pub shipped_grams: i32,
    pub dimensions: Dimensions,
}

/// Parses `"227gm"`, `"0.5kg"`, `"250"` (grams) and the like.
pub fn parse_size_grams(size: &str) -> Option<Decimal> {
    let re = SIZE_TOKEN.as_ref().ok()?;
    let caps = re.captures(size)?;
    let value = Decimal::from_str(caps.get(1)?.as_str()).ok()?;
    let grams = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit.starts_with('k') => value * Decimal::from(1000),
        _ => value,
    };
    (grams > Decimal::ZERO).then_some(grams)
}

/// Weight of one unit of `size`, falling back to the default.
pub fn unit_grams(size: &str) -> Decimal {
    parse_size_grams(size).unwrap_or_else(|| Decimal::from(DEFAULT_ITEM_GRAMS))
}

/// Sum of unit weight times quantity. Non-positive quantities contribute nothing.
pub fn item_grams<'a, I>(lines: I) -> Decimal
where
    I: IntoIterator<Item = (&'a str, i32)>,
{
    lines
        .into_iter()
        .filter(|(_, qty)| *qty > 0)
        .map(|(size, qty)| unit_grams(size) * Decimal::from(qty))
        .sum()
}

pub fn select_package(item_grams: Decimal) -> PackageSelection {
    let tier = PackageTier::for_item_weight(item_grams);
    let gross =
        (item_grams + Decimal::from(tier.packaging_grams())).max(Decimal::from(MIN_SHIPPED_GRAMS));
    PackageSelection {
        tier,
        item_grams,
        shipped_grams: gross.ceil().to_i32().unwrap_or(i32::MAX),
        dimensions: tier.dimensions(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case("227gm", Some(227))]
    #[case("227 GM", Some(227))]
    #[case("250g", Some(250))]
    #[case("100gms", Some(100))]
    #[case("500 grams", Some(500))]
    #[case("0.5kg", Some(500))]
    #[case("1KG", Some(1000))]
    #[case("1.25 kgs", Some(1250))]
    #[case("340", Some(340))]
    #[case("large", None)]
    #[case("", None)]
    #[case("0g", None)]
    #[case("12oz", None)]
    fn parses_size_tokens(#[case] size: &str, #[case] grams: Option<i64>) {
        assert_eq!(parse_size_grams(size), grams.map(Decimal::from));
    }

    #[rstest]
    #[case(200, PackageTier::P1, 253)]
    #[case(227, PackageTier::P1, 280)]
    #[case(280, PackageTier::P1, 333)]
    #[case(300, PackageTier::P2, 370)]
    #[case(454, PackageTier::P2, 524)]
    #[case(490, PackageTier::P2, 560)]
    #[case(600, PackageTier::P3, 710)]
    fn selects_tier_by_item_weight(
        #[case] item: i64,
        #[case] tier: PackageTier,
        #[case] shipped: i32,
    ) {
        let selection = select_package(Decimal::from(item));
        assert_eq!(selection.tier, tier);
        assert_eq!(selection.shipped_grams, shipped);
        assert_eq!(selection.dimensions, tier.dimensions());
    }

    #[test]
    fn shipped_weight_is_floored_and_rounded_up() {
        assert_eq!(select_package(Decimal::ZERO).shipped_grams, 100);
        assert_eq!(select_package(Decimal::from(10)).shipped_grams, 100);
        // 250.5g + 53g packaging
        assert_eq!(select_package(dec!(250.5)).shipped_grams, 304);
        assert_eq!(parse_size_grams("0.2505kg"), Some(dec!(250.5)));
    }

    #[test]
    fn multiplies_by_quantity_and_defaults_unknown_sizes() {
        let grams = item_grams([("227gm", 2), ("mystery", 1), ("0.1kg", 0)]);
        assert_eq!(grams, Decimal::from(227 * 2 + 500));
    }
}
