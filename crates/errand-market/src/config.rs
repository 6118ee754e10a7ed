//! Marketplace configuration.
//!
//! Configuration for the matching engine, including:
//! - Offer and errand time-to-live
//! - Matching strategy and broadcast fan-out
//! - Retry policy for collaborator failures
//! - Background sweep cadence
//! - Pricing rates

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};

/// Longest offer TTL accepted by [`MarketConfig::validate`] (one day).
pub const MAX_OFFER_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Longest errand TTL accepted by [`MarketConfig::validate`] (30 days).
pub const MAX_ERRAND_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest sweep interval accepted by [`MarketConfig::validate`] (one hour).
pub const MAX_SWEEP_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// How offers are issued to ranked runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Offer every ranked runner (up to the broadcast limit) at once; the
    /// first acceptance wins.
    #[default]
    Broadcast,
    /// Offer one runner at a time in rank order, advancing on rejection or
    /// offer expiry.
    Sequential,
}

impl std::fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broadcast => write!(f, "broadcast"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Pricing rates applied when a runner accepts an errand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Service fee in basis points of the task subtotal (2000 = 20%).
    pub service_fee_bps: u64,
    /// Distance fee in minor units per kilometer.
    pub distance_rate_per_km: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            service_fee_bps: 2_000,
            distance_rate_per_km: 250,
        }
    }
}

/// Bounded retry policy for collaborator calls made during matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay between attempts.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

/// Main marketplace configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// How long a runner has to answer an offer, in milliseconds.
    pub offer_ttl_ms: u64,
    /// Matching window for a new errand, in seconds.
    pub errand_ttl_secs: u64,
    /// Offer strategy.
    pub strategy: MatchStrategy,
    /// Maximum runners offered at once in broadcast mode.
    pub broadcast_limit: usize,
    /// Retry policy for candidate lookup and offer sends.
    pub retry: RetryPolicy,
    /// Interval between background sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
    /// Pricing rates.
    pub pricing: PricingConfig,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            offer_ttl_ms: 60_000,
            errand_ttl_secs: 2 * 60 * 60,
            strategy: MatchStrategy::Broadcast,
            broadcast_limit: 10,
            retry: RetryPolicy::default(),
            sweep_interval_ms: 5_000,
            pricing: PricingConfig::default(),
        }
    }
}

impl MarketConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the offer TTL.
    #[must_use]
    pub fn with_offer_ttl(mut self, ttl: Duration) -> Self {
        self.offer_ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the errand matching window.
    #[must_use]
    pub fn with_errand_ttl(mut self, ttl: Duration) -> Self {
        self.errand_ttl_secs = ttl.as_secs();
        self
    }

    /// Sets the offer strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: MatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the broadcast fan-out limit.
    #[must_use]
    pub fn with_broadcast_limit(mut self, limit: usize) -> Self {
        self.broadcast_limit = limit;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Offer TTL as a chrono duration.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::Config`] if the value does not fit a duration.
    pub fn offer_ttl(&self) -> Result<chrono::Duration> {
        i64::try_from(self.offer_ttl_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .ok_or_else(|| {
                MarketError::Config(format!("offer_ttl_ms {} is out of range", self.offer_ttl_ms))
            })
    }

    /// Errand TTL as a chrono duration.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::Config`] if the value does not fit a duration.
    pub fn errand_ttl(&self) -> Result<chrono::Duration> {
        i64::try_from(self.errand_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                MarketError::Config(format!(
                    "errand_ttl_secs {} is out of range",
                    self.errand_ttl_secs
                ))
            })
    }

    /// Sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.offer_ttl_ms == 0 {
            return Err(MarketError::Config(
                "offer_ttl_ms must be greater than 0".to_string(),
            ));
        }

        if self.offer_ttl_ms > MAX_OFFER_TTL_MS {
            return Err(MarketError::Config(format!(
                "offer_ttl_ms cannot exceed {MAX_OFFER_TTL_MS}"
            )));
        }

        if self.errand_ttl_secs == 0 {
            return Err(MarketError::Config(
                "errand_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.errand_ttl_secs > MAX_ERRAND_TTL_SECS {
            return Err(MarketError::Config(format!(
                "errand_ttl_secs cannot exceed {MAX_ERRAND_TTL_SECS}"
            )));
        }

        if self.broadcast_limit == 0 {
            return Err(MarketError::Config(
                "broadcast_limit must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(MarketError::Config(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_ms == 0 {
            return Err(MarketError::Config(
                "sweep_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_ms > MAX_SWEEP_INTERVAL_MS {
            return Err(MarketError::Config(format!(
                "sweep_interval_ms cannot exceed {MAX_SWEEP_INTERVAL_MS}"
            )));
        }

        if self.pricing.service_fee_bps > 10_000 {
            return Err(MarketError::Config(
                "pricing.service_fee_bps cannot exceed 10000".to_string(),
            ));
        }

        Ok(())
    }
}
