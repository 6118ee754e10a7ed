//! Collaborator interfaces consumed by the engine.
//!
//! Implement these traits to integrate with real infrastructure:
//! - [`CandidateSource`]: supplies eligible runners for an errand
//! - [`Notifier`]: tells a runner about a new offer
//! - [`PaymentGateway`]: charges, payouts and refunds
//! - [`Clock`]: current time, injectable for tests
//!
//! Notifier and gateway calls are best-effort from the engine's point of
//! view: failures are logged and reported as side effects, never rolled
//! back into local state.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errand::Errand;
use crate::error::{MarketError, Result};
use crate::offer::Offer;
use crate::ranking::RunnerCandidate;
use crate::types::UserId;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Supplies runners eligible for an errand.
///
/// Implementations own eligibility (runner capability, saved location) and
/// join in each runner's trust score. Ordering is done by
/// [`rank`](crate::ranking::rank).
pub trait CandidateSource: Send + Sync {
    /// Returns eligible runners for the errand.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::CandidateSource`] if the lookup fails.
    fn nearby_runners(&self, errand: &Errand) -> Result<Vec<RunnerCandidate>>;
}

/// Delivers offer notifications to runners.
pub trait Notifier: Send + Sync {
    /// Notifies a runner of a new or refreshed offer.
    ///
    /// # Errors
    ///
    /// Returns error if delivery fails. Callers never fail the offer on this.
    fn notify_offer(&self, runner_id: &UserId, offer: &Offer) -> Result<()>;
}

/// Opaque reference returned by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayRef(pub String);

impl std::fmt::Display for GatewayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payment gateway capability.
pub trait PaymentGateway: Send + Sync {
    /// Initializes a charge against the payer.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::GatewayFailure`] on gateway errors.
    fn init_charge(&self, amount: u64, payer: &UserId) -> Result<GatewayRef>;

    /// Transfers a payout to the payee.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::GatewayFailure`] on gateway errors.
    fn transfer(&self, amount: u64, payee: &UserId) -> Result<GatewayRef>;

    /// Refunds a previous charge.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::GatewayFailure`] on gateway errors.
    fn refund(&self, charge: Option<&GatewayRef>, amount: u64) -> Result<GatewayRef>;
}

/// A notifier that only logs.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify_offer(&self, runner_id: &UserId, offer: &Offer) -> Result<()> {
        info!(
            runner_id = %runner_id,
            offer_id = %offer.id,
            errand_id = %offer.errand_id,
            expires_at = %offer.expires_at,
            "offer available"
        );
        Ok(())
    }
}

/// A notifier that records deliveries (for testing).
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: RwLock<Vec<(UserId, Offer)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    /// Creates a new recording notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent delivery fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Returns all deliveries so far.
    #[must_use]
    pub fn delivered(&self) -> Vec<(UserId, Offer)> {
        self.delivered.read().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_offer(&self, runner_id: &UserId, offer: &Offer) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MarketError::GatewayFailure("notifier unavailable".into()));
        }
        self.delivered.write().push((runner_id.clone(), offer.clone()));
        Ok(())
    }
}

/// A gateway call captured by [`RecordingGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `init_charge(amount, payer)`.
    Charge {
        /// Amount charged.
        amount: u64,
        /// Who pays.
        payer: UserId,
    },
    /// `transfer(amount, payee)`.
    Transfer {
        /// Amount paid out.
        amount: u64,
        /// Who receives.
        payee: UserId,
    },
    /// `refund(charge, amount)`.
    Refund {
        /// Charge being refunded, if known.
        charge: Option<GatewayRef>,
        /// Amount refunded.
        amount: u64,
    },
}

/// A gateway that accepts every call and does nothing.
#[derive(Debug, Default)]
pub struct NoOpGateway;

impl PaymentGateway for NoOpGateway {
    fn init_charge(&self, amount: u64, payer: &UserId) -> Result<GatewayRef> {
        debug!(amount, payer = %payer, "NoOp charge");
        Ok(GatewayRef(format!("noop-charge-{payer}")))
    }

    fn transfer(&self, amount: u64, payee: &UserId) -> Result<GatewayRef> {
        debug!(amount, payee = %payee, "NoOp transfer");
        Ok(GatewayRef(format!("noop-transfer-{payee}")))
    }

    fn refund(&self, charge: Option<&GatewayRef>, amount: u64) -> Result<GatewayRef> {
        debug!(amount, charge = ?charge, "NoOp refund");
        Ok(GatewayRef("noop-refund".to_string()))
    }
}

/// A gateway that records calls and can be told to fail (for testing).
#[derive(Debug, Default)]
pub struct RecordingGateway {
    calls: RwLock<Vec<GatewayCall>>,
    fail: AtomicBool,
}

impl RecordingGateway {
    /// Creates a new recording gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Returns all calls so far, including failed ones.
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.read().clone()
    }

    fn record(&self, call: GatewayCall) -> Result<GatewayRef> {
        let mut calls = self.calls.write();
        calls.push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MarketError::GatewayFailure("gateway unavailable".into()));
        }
        Ok(GatewayRef(format!("ref-{}", calls.len())))
    }
}

impl PaymentGateway for RecordingGateway {
    fn init_charge(&self, amount: u64, payer: &UserId) -> Result<GatewayRef> {
        self.record(GatewayCall::Charge {
            amount,
            payer: payer.clone(),
        })
    }

    fn transfer(&self, amount: u64, payee: &UserId) -> Result<GatewayRef> {
        self.record(GatewayCall::Transfer {
            amount,
            payee: payee.clone(),
        })
    }

    fn refund(&self, charge: Option<&GatewayRef>, amount: u64) -> Result<GatewayRef> {
        self.record(GatewayCall::Refund {
            charge: charge.cloned(),
            amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn recording_gateway_records_and_fails() {
        let gateway = RecordingGateway::new();
        let payer = UserId::new("buyer");
        let first = gateway.init_charge(100, &payer);
        assert_eq!(first, Ok(GatewayRef("ref-1".into())));

        gateway.set_failing(true);
        let second = gateway.refund(None, 100);
        assert!(matches!(second, Err(MarketError::GatewayFailure(_))));

        assert_eq!(
            gateway.calls(),
            vec![
                GatewayCall::Charge {
                    amount: 100,
                    payer,
                },
                GatewayCall::Refund {
                    charge: None,
                    amount: 100,
                },
            ]
        );
    }

    #[test]
    fn noop_gateway_always_succeeds() {
        let gateway = NoOpGateway;
        let user = UserId::new("u");
        assert!(gateway.init_charge(1, &user).is_ok());
        assert!(gateway.transfer(1, &user).is_ok());
        assert!(gateway.refund(None, 1).is_ok());
    }
}
