use crate::models::Orderbook;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Round an order quantity to three significant digits, then to at most
/// eight fractional digits.
///
/// Non-positive or non-finite input yields `0.0`.
pub fn adjust_number(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }

    // `{:.2e}` rounds the mantissa to two fractional digits
    let scientific = format!("{:.2e}", value);
    Decimal::from_scientific(&scientific)
        .ok()
        .map(|d| d.round_dp(8))
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

/// Like `adjust_number`, but the mantissa is truncated, so the result never
/// exceeds `value`. Used for sell quantities bounded by a balance.
pub fn floor_quantity(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    let Some(exact) = to_decimal(value) else {
        return 0.0;
    };

    // decimal exponent of the leading digit
    let exponent = value.log10().floor() as i32;
    let truncated = if exponent <= 2 {
        exact.round_dp_with_strategy((2 - exponent).min(8) as u32, RoundingStrategy::ToZero)
    } else {
        let Some(scale) = 10u64.checked_pow((exponent - 2) as u32) else {
            return 0.0;
        };
        let scale = Decimal::from(scale);
        (exact / scale).trunc() * scale
    };

    truncated.to_f64().map(|q| q.min(value)).unwrap_or(0.0)
}

/// Round to eight fractional digits, the finest quantity the exchange accepts
pub fn round_quantity(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }

    to_decimal(value)
        .map(|d| d.round_dp_with_strategy(8, RoundingStrategy::ToZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

/// Decimal string for request parameters, free of float artifacts
pub fn format_decimal(value: f64) -> String {
    to_decimal(value)
        .map(|d| d.round_dp(8).normalize().to_string())
        .unwrap_or_else(|| value.to_string())
}

// Shortest round-trip representation, so 0.123 stays 0.123
fn to_decimal(value: f64) -> Option<Decimal> {
    value.to_string().parse::<Decimal>().ok()
}

/// First ask at or above `target`, otherwise the target itself
pub fn optimal_sell_price(orderbook: &Orderbook, target: f64) -> f64 {
    orderbook
        .units
        .iter()
        .map(|unit| unit.ask_price)
        .find(|ask| ask.is_finite() && *ask >= target)
        .unwrap_or_else(|| adjust_number(target))
}
