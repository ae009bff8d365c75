//! Integer amount helpers for native asset units.
//!
//! Capital is held as `u128` in the asset's smallest unit. Ratios and prices
//! stay in `Decimal`; these helpers bridge the two without going through
//! floating point.

use crate::allocation::Amount;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Scale `amount` by a non-negative ratio, rounding down.
///
/// Negative ratios yield zero. The multiplication is done on the decimal's
/// mantissa so the result is exact up to the final floor.
pub fn apply_ratio(amount: Amount, ratio: Decimal) -> Amount {
    if ratio <= Decimal::ZERO || amount == 0 {
        return 0;
    }

    let mantissa = ratio.mantissa().unsigned_abs();
    let scale = 10u128.pow(ratio.scale());

    match amount.checked_mul(mantissa) {
        Some(product) => product / scale,
        // Huge amounts: divide first and accept the coarser floor
        None => (amount / scale).saturating_mul(mantissa),
    }
}

/// Convert native units into whole-token units (e.g. 1_500_000 with 6 decimals -> 1.5).
///
/// Saturates at `Decimal::MAX` for amounts beyond decimal range.
pub fn to_ui_amount(amount: Amount, decimals: u32) -> Decimal {
    let value = Decimal::from_u128(amount).unwrap_or(Decimal::MAX);
    let divisor = Decimal::from_u128(10u128.pow(decimals.min(28))).unwrap_or(Decimal::ONE);
    value / divisor
}

/// Sum amounts without wrapping.
pub fn saturating_sum<I: IntoIterator<Item = Amount>>(values: I) -> Amount {
    values
        .into_iter()
        .fold(0, |acc: Amount, v| acc.saturating_add(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_ratio_floors() {
        assert_eq!(apply_ratio(1_000_000, dec!(0.98)), 980_000);
        assert_eq!(apply_ratio(999, dec!(0.98)), 979); // 979.02
        assert_eq!(apply_ratio(1, dec!(0.5)), 0);
    }

    #[test]
    fn test_apply_ratio_edges() {
        assert_eq!(apply_ratio(12345, Decimal::ONE), 12345);
        assert_eq!(apply_ratio(12345, Decimal::ZERO), 0);
        assert_eq!(apply_ratio(12345, dec!(-0.5)), 0);
        assert_eq!(apply_ratio(0, dec!(0.98)), 0);
    }

    #[test]
    fn test_apply_ratio_huge_amount_does_not_overflow() {
        let result = apply_ratio(u128::MAX, dec!(0.98));
        assert!(result > 0);
        assert!(result < u128::MAX);
    }

    #[test]
    fn test_to_ui_amount() {
        assert_eq!(to_ui_amount(1_500_000, 6), dec!(1.5));
        assert_eq!(to_ui_amount(0, 9), Decimal::ZERO);
    }

    #[test]
    fn test_saturating_sum() {
        assert_eq!(saturating_sum([1, 2, 3]), 6);
        assert_eq!(saturating_sum([u128::MAX, 5]), u128::MAX);
    }
}
