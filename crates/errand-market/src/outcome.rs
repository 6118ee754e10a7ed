//! Results of marketplace mutations.
//!
//! A mutation has one primary result plus any number of side effects
//! (escrow moves, gateway calls, notifications). Side effects never undo the
//! primary result; failures among them are reported here instead of being
//! propagated.

use crate::error::MarketError;
use crate::types::{EscrowId, OfferId, UserId};

/// Something that happened because of a primary mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// An escrow was opened for the errand.
    EscrowCreated {
        /// The new escrow.
        escrow_id: EscrowId,
        /// Amount held.
        amount: u64,
    },
    /// No escrow was opened (zero total).
    EscrowSkipped {
        /// Why.
        reason: String,
    },
    /// Funds were released to the runner.
    EscrowReleased {
        /// The escrow.
        escrow_id: EscrowId,
        /// Amount released.
        amount: u64,
    },
    /// Funds were returned to the buyer.
    EscrowRefunded {
        /// The escrow.
        escrow_id: EscrowId,
        /// Amount refunded.
        amount: u64,
    },
    /// A refund was requested but there was nothing to do.
    EscrowUnchanged {
        /// Why.
        reason: String,
    },
    /// An escrow handler refused the change.
    EscrowFailed {
        /// The refusal.
        error: MarketError,
    },
    /// A payment gateway call failed.
    GatewayFailed {
        /// Which call.
        operation: &'static str,
        /// The failure.
        error: MarketError,
    },
    /// Pending offers were expired.
    OffersExpired {
        /// How many.
        count: usize,
    },
    /// A runner notification could not be delivered.
    NotifyFailed {
        /// Who was not told.
        runner_id: UserId,
        /// About which offer.
        offer_id: OfferId,
        /// The failure.
        error: MarketError,
    },
    /// A user's trust score changed.
    TrustUpdated {
        /// Whose score.
        user_id: UserId,
        /// Score before.
        old: u8,
        /// Score after.
        new: u8,
    },
}

impl SideEffect {
    /// Returns true for the failure variants.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::EscrowFailed { .. } | Self::GatewayFailed { .. } | Self::NotifyFailed { .. }
        )
    }
}

/// A primary result plus the side effects it caused.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    /// The primary result.
    pub primary: T,
    /// Side effects, in the order they happened.
    pub side_effects: Vec<SideEffect>,
}

impl<T> Outcome<T> {
    /// Wraps a result with no side effects.
    pub const fn new(primary: T) -> Self {
        Self {
            primary,
            side_effects: Vec::new(),
        }
    }

    /// Adds a side effect.
    #[must_use]
    pub fn with_effect(mut self, effect: SideEffect) -> Self {
        self.side_effects.push(effect);
        self
    }

    /// Appends side effects.
    pub fn extend(&mut self, effects: impl IntoIterator<Item = SideEffect>) {
        self.side_effects.extend(effects);
    }

    /// Maps the primary result, keeping side effects.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            primary: f(self.primary),
            side_effects: self.side_effects,
        }
    }

    /// Returns the failure side effects.
    pub fn failures(&self) -> impl Iterator<Item = &SideEffect> {
        self.side_effects.iter().filter(|e| e.is_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keeps_side_effects() {
        let outcome = Outcome::new(2)
            .with_effect(SideEffect::OffersExpired { count: 3 })
            .map(|n| n * 10);
        assert_eq!(outcome.primary, 20);
        assert_eq!(outcome.side_effects, vec![SideEffect::OffersExpired { count: 3 }]);
    }

    #[test]
    fn failures_filters() {
        let mut outcome = Outcome::new(());
        outcome.extend([
            SideEffect::EscrowSkipped {
                reason: "zero total".into(),
            },
            SideEffect::GatewayFailed {
                operation: "refund",
                error: MarketError::GatewayFailure("down".into()),
            },
        ]);
        assert_eq!(outcome.failures().count(), 1);
    }
}
