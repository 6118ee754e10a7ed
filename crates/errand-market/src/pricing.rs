//! Price quotes computed when a runner accepts an errand.
//!
//! # Formula
//!
//! ```text
//! errand_value = Σ task.price
//! service_fee  = round(errand_value × service_fee_bps / 10_000)
//! distance_fee = round(distance_km × distance_rate_per_km)
//! total        = errand_value + service_fee + distance_fee
//! ```
//!
//! The service fee uses integer arithmetic with `u128` intermediates and
//! rounds half up. The distance fee is the only floating-point step; a
//! non-finite distance (runner without a usable location) yields a zero fee.
//! All sums saturate at `u64::MAX`.

use serde::{Deserialize, Serialize};

use crate::config::PricingConfig;
use crate::types::Task;

const BPS_DENOMINATOR: u128 = 10_000;

/// A price breakdown, in currency minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Sum of task prices.
    pub errand_value: u64,
    /// Platform service fee.
    pub service_fee: u64,
    /// Travel fee based on runner distance.
    pub distance_fee: u64,
    /// What the buyer pays.
    pub total: u64,
}

/// Sums task prices, saturating on overflow.
#[must_use]
pub fn errand_value(tasks: &[Task]) -> u64 {
    tasks.iter().fold(0u64, |acc, t| acc.saturating_add(t.price))
}

/// Computes `round(value × bps / 10_000)` with half-up rounding.
///
/// # Examples
/// ```
/// use errand_market::pricing::service_fee;
///
/// assert_eq!(service_fee(1000, 2000), 200);
/// assert_eq!(service_fee(3, 2000), 1); // 0.6 rounds up
/// assert_eq!(service_fee(2, 2000), 0); // 0.4 rounds down
/// ```
#[must_use]
pub const fn service_fee(value: u64, bps: u64) -> u64 {
    let numerator = value as u128 * bps as u128;
    let fee = (numerator + BPS_DENOMINATOR / 2) / BPS_DENOMINATOR;
    if fee > u64::MAX as u128 {
        u64::MAX
    } else {
        fee as u64
    }
}

/// Computes `round(distance_km × rate_per_km)`.
///
/// Returns 0 for negative or non-finite distances.
#[must_use]
pub fn distance_fee(distance_km: f64, rate_per_km: u64) -> u64 {
    if !distance_km.is_finite() || distance_km <= 0.0 {
        return 0;
    }
    let fee = (distance_km * rate_per_km as f64).round();
    if fee >= u64::MAX as f64 { u64::MAX } else { fee as u64 }
}

/// Builds a full quote for an errand's tasks and the runner's distance.
#[must_use]
pub fn quote(tasks: &[Task], distance_km: f64, pricing: &PricingConfig) -> Quote {
    let value = errand_value(tasks);
    let service = service_fee(value, pricing.service_fee_bps);
    let distance = distance_fee(distance_km, pricing.distance_rate_per_km);
    Quote {
        errand_value: value,
        service_fee: service,
        distance_fee: distance,
        total: value.saturating_add(service).saturating_add(distance),
    }
}
