//! Price and amount arithmetic shared by every runtime
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::types::PairInfo;

/// Floor `x` to `p` decimal places. Idempotent: re-flooring an already
/// floored value returns it unchanged.
pub fn floor_to_precision(x: f64, p: u32) -> f64 {
    let scale = 10f64.powi(p as i32);
    // x * scale can land one ulp under the intended integer
    // (0.29 * 100.0 == 28.999999999999996), which would make flooring
    // unstable. Nudge by a few ulps before flooring.
    let scaled = x * scale;
    let nudged = scaled + scaled.abs() * 4.0 * f64::EPSILON;
    nudged.floor() / scale
}

/// Round `x` to the nearest multiple of `inc`. Used for tick sizes >= 1.
pub fn round_to_nearest_increment(x: f64, inc: f64) -> f64 {
    if inc <= 0.0 {
        return x;
    }
    (x / inc).round() * inc
}

/// Align a price to the pair's precision and tick size.
pub fn align_price(price: f64, pair: &PairInfo) -> f64 {
    let floored = floor_to_precision(price, pair.price_precision);
    if pair.tick_size >= 1.0 {
        round_to_nearest_increment(floored, pair.tick_size)
    } else {
        floored
    }
}

/// Floor an order amount to the pair's volume precision and validate it
/// against the exchange minima and the sanity cap. Returns the rounded
/// amount on success.
pub fn validate_order_amount(
    amount: f64,
    price: f64,
    pair: &PairInfo,
    max_coin_amount: f64,
) -> Result<f64> {
    let rounded = floor_to_precision(amount, pair.volume_precision);

    if rounded <= 0.0 {
        return Err(EngineError::BelowMinimum(format!(
            "{}: amount {} rounds to zero",
            pair.id, amount
        )));
    }
    if rounded < pair.min_base_amount {
        return Err(EngineError::BelowMinimum(format!(
            "{}: amount {} below min base {}",
            pair.id, rounded, pair.min_base_amount
        )));
    }
    if rounded * price < pair.min_quote_amount {
        return Err(EngineError::BelowMinimum(format!(
            "{}: value {} below min quote {}",
            pair.id,
            rounded * price,
            pair.min_quote_amount
        )));
    }
    if rounded > max_coin_amount {
        return Err(EngineError::InvalidParameter(format!(
            "{}: amount {} exceeds sanity cap",
            pair.id, rounded
        )));
    }

    Ok(rounded)
}

/// Repair a bot's virtual-balance map in place. This is the only place
/// balances are ever "fixed": every required currency exists afterwards,
/// nothing is negative, nothing is implausibly large, and a zeroed quote
/// balance is restored to the initial allocation. Returns true when
/// anything was mutated.
pub fn normalize_balances(
    balances: &mut HashMap<String, f64>,
    quote_currency: &str,
    required: &[&str],
    initial_idr: f64,
    max_reasonable_idr: f64,
    max_reasonable_coin: f64,
) -> bool {
    let mut repaired = false;

    for currency in required {
        let entry = balances.entry(currency.to_string()).or_insert_with(|| {
            repaired = true;
            0.0
        });

        let is_quote = *currency == quote_currency;
        let cap = if is_quote { max_reasonable_idr } else { max_reasonable_coin };

        if !entry.is_finite() || *entry < 0.0 {
            *entry = if is_quote { initial_idr } else { 0.0 };
            repaired = true;
        } else if *entry > cap || (is_quote && initial_idr > 0.0 && *entry > initial_idr * 10.0) {
            *entry = if is_quote { initial_idr } else { 0.0 };
            repaired = true;
        } else if is_quote && *entry == 0.0 && initial_idr > 0.0 {
            *entry = initial_idr;
            repaired = true;
        }
    }

    repaired
}
