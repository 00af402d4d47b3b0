//! Monetary rounding helpers.
//!
//! Amounts are carried as `f64` in the cart model and on the wire; rounding
//! goes through `rust_decimal` so half-up behaviour is exact.

use rust_decimal::prelude::*;
use tracing::warn;

const DECIMAL_PLACES: u32 = 2;

/// Largest magnitude accepted by the ingestion endpoint's money columns.
pub const MAX_MONETARY_VALUE: f64 = 99_999_999.99;

/// Default tolerance when comparing local totals to server totals.
pub const DRIFT_TOLERANCE: f64 = 0.02;

/// Round to cents, half away from zero. Non-finite input rounds to zero.
pub fn round_money(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

/// Clamp to `±MAX_MONETARY_VALUE` then round to cents.
pub fn clamp_money(field: &str, value: f64) -> f64 {
    let rounded = round_money(value);
    if rounded.abs() > MAX_MONETARY_VALUE {
        warn!(field, value, "monetary value clamped to column limit");
        return MAX_MONETARY_VALUE.copysign(rounded);
    }
    rounded
}

/// `percent` of `base`, rounded to cents.
pub fn percent_of(base: f64, percent: f64) -> f64 {
    let (Some(b), Some(p)) = (Decimal::from_f64(base), Decimal::from_f64(percent)) else {
        return 0.0;
    };
    (b * p / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(0.0)
}

/// True when `|a - b|` exceeds `tolerance`, compared in cents so float noise
/// at exactly the threshold does not count as drift.
pub fn exceeds_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    let diff = (round_money(a) - round_money(b)).abs();
    round_money(diff) > round_money(tolerance)
}
