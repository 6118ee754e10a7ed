//! Escrow management for errand payments.
//!
//! Holds the buyer's funds between acceptance and the errand's terminal
//! state, driven by errand [`StatusChange`]s:
//!
//! | Change                    | Escrow action                       |
//! |---------------------------|-------------------------------------|
//! | PENDING → IN_PROGRESS     | create PENDING escrow, charge buyer |
//! | * → COMPLETED             | release to runner                   |
//! | * → CANCELLED / EXPIRED   | refund buyer if PENDING             |
//!
//! Gateway calls are made outside the ledger lock and are best-effort: the
//! escrow status is committed first, failures surface as side effects.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errand::{Errand, ErrandStatus, StatusChange};
use crate::error::{MarketError, Result};
use crate::outcome::{Outcome, SideEffect};
use crate::ports::{GatewayRef, PaymentGateway};
use crate::types::{ErrandId, EscrowId, UserId};

/// The state of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    /// Funds held.
    Pending,
    /// Funds paid out to the runner.
    Released,
    /// Funds returned to the buyer.
    Refunded,
    /// Escrow voided before settlement.
    Cancelled,
}

impl EscrowStatus {
    /// Checks if a transition to the target state is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        use EscrowStatus::{Cancelled, Pending, Refunded, Released};

        matches!(
            (self, target),
            (Pending, Released) | (Pending, Refunded) | (Pending, Cancelled)
        )
    }

    /// Returns true once funds have left custody.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Released => write!(f, "RELEASED"),
            Self::Refunded => write!(f, "REFUNDED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Funds held for one errand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    /// Unique identifier.
    pub id: EscrowId,
    /// The errand paid for.
    pub errand_id: ErrandId,
    /// Who paid.
    pub buyer_id: UserId,
    /// Who gets paid on completion.
    pub runner_id: Option<UserId>,
    /// Amount held, fixed at creation.
    pub amount: u64,
    /// Current state.
    pub status: EscrowStatus,
    /// Gateway reference of the buyer charge.
    pub transaction_id: Option<GatewayRef>,
    /// When the escrow was opened.
    pub created_at: DateTime<Utc>,
    /// When funds were released.
    pub released_at: Option<DateTime<Utc>>,
    /// When funds were refunded.
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Escrow {
    fn transition_to(&mut self, target: EscrowStatus) -> Result<()> {
        if self.status.can_transition_to(&target) {
            self.status = target;
            Ok(())
        } else {
            Err(MarketError::invalid_transition(self.status, target))
        }
    }
}

/// Escrow records, at most one per errand.
pub struct EscrowLedger {
    escrows: RwLock<HashMap<ErrandId, Escrow>>,
    gateway: Arc<dyn PaymentGateway>,
}

impl std::fmt::Debug for EscrowLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowLedger")
            .field("escrows", &self.escrows.read().len())
            .finish_non_exhaustive()
    }
}

impl EscrowLedger {
    /// Creates an empty ledger backed by the gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            escrows: RwLock::new(HashMap::new()),
            gateway,
        }
    }

    /// Applies the escrow action for an errand status change.
    ///
    /// Never fails: refusals and gateway errors are returned as side effects
    /// so the errand transition that triggered them stands.
    pub fn on_status_change(
        &self,
        change: &StatusChange,
        errand: &Errand,
        now: DateTime<Utc>,
    ) -> Vec<SideEffect> {
        let result = match (change.from, change.to) {
            (ErrandStatus::Pending, ErrandStatus::InProgress) => {
                self.create(errand, now).map(|o| o.side_effects)
            }
            (_, ErrandStatus::Completed) => self.release(&change.errand_id, now).map(|o| o.side_effects),
            (_, ErrandStatus::Cancelled | ErrandStatus::Expired) => {
                Ok(self.refund(&change.errand_id, now).side_effects)
            }
            _ => Ok(Vec::new()),
        };

        result.unwrap_or_else(|error| {
            warn!(
                errand_id = %change.errand_id,
                from = %change.from,
                to = %change.to,
                error = %error,
                "escrow handler refused status change"
            );
            vec![SideEffect::EscrowFailed { error }]
        })
    }

    /// Opens the escrow for an accepted errand.
    ///
    /// Returns `None` as the primary result when the quoted total is zero.
    ///
    /// # Errors
    ///
    /// - [`MarketError::InvalidTransition`] if the errand is not IN_PROGRESS
    /// - [`MarketError::EscrowAlreadyExists`] if the errand already has one
    pub fn create(&self, errand: &Errand, now: DateTime<Utc>) -> Result<Outcome<Option<Escrow>>> {
        if errand.status != ErrandStatus::InProgress {
            return Err(MarketError::invalid_transition(
                errand.status,
                ErrandStatus::InProgress,
            ));
        }
        if errand.quoted_total_price == 0 {
            debug!(errand_id = %errand.id, "zero total, no escrow");
            return Ok(Outcome::new(None).with_effect(SideEffect::EscrowSkipped {
                reason: "zero total".into(),
            }));
        }

        let escrow = {
            let mut escrows = self.escrows.write();
            if escrows.contains_key(&errand.id) {
                return Err(MarketError::EscrowAlreadyExists(errand.id.to_string()));
            }
            let escrow = Escrow {
                id: EscrowId::generate(),
                errand_id: errand.id.clone(),
                buyer_id: errand.buyer_id.clone(),
                runner_id: errand.assigned_runner_id.clone(),
                amount: errand.quoted_total_price,
                status: EscrowStatus::Pending,
                transaction_id: None,
                created_at: now,
                released_at: None,
                refunded_at: None,
            };
            escrows.insert(errand.id.clone(), escrow.clone());
            escrow
        };

        info!(
            escrow_id = %escrow.id,
            errand_id = %escrow.errand_id,
            amount = escrow.amount,
            "escrow created"
        );

        let mut outcome = Outcome::new(None).with_effect(SideEffect::EscrowCreated {
            escrow_id: escrow.id.clone(),
            amount: escrow.amount,
        });

        match self.gateway.init_charge(escrow.amount, &escrow.buyer_id) {
            Ok(reference) => {
                let mut escrows = self.escrows.write();
                if let Some(stored) = escrows.get_mut(&errand.id) {
                    stored.transaction_id = Some(reference);
                    outcome.primary = Some(stored.clone());
                }
            }
            Err(error) => {
                warn!(escrow_id = %escrow.id, error = %error, "charge failed");
                outcome.primary = Some(escrow);
                outcome.extend([SideEffect::GatewayFailed {
                    operation: "init_charge",
                    error,
                }]);
            }
        }

        Ok(outcome)
    }

    /// Releases held funds to the runner.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::CannotRelease`] if there is no escrow, it is
    /// not PENDING, or it has no runner.
    pub fn release(&self, errand_id: &ErrandId, now: DateTime<Utc>) -> Result<Outcome<Escrow>> {
        let (escrow, runner_id) = {
            let mut escrows = self.escrows.write();
            let escrow = escrows.get_mut(errand_id).ok_or_else(|| {
                MarketError::CannotRelease(format!("no escrow for errand {errand_id}"))
            })?;
            if escrow.status != EscrowStatus::Pending {
                return Err(MarketError::CannotRelease(format!(
                    "escrow {} is {}",
                    escrow.id, escrow.status
                )));
            }
            let runner_id = escrow.runner_id.clone().ok_or_else(|| {
                MarketError::CannotRelease(format!("escrow {} has no runner", escrow.id))
            })?;
            escrow.transition_to(EscrowStatus::Released)?;
            escrow.released_at = Some(now);
            (escrow.clone(), runner_id)
        };

        info!(escrow_id = %escrow.id, errand_id = %errand_id, amount = escrow.amount, "escrow released");

        let mut effects = vec![SideEffect::EscrowReleased {
            escrow_id: escrow.id.clone(),
            amount: escrow.amount,
        }];
        if let Err(error) = self.gateway.transfer(escrow.amount, &runner_id) {
            warn!(escrow_id = %escrow.id, error = %error, "payout failed");
            effects.push(SideEffect::GatewayFailed {
                operation: "transfer",
                error,
            });
        }

        Ok(Outcome {
            primary: escrow,
            side_effects: effects,
        })
    }

    /// Returns held funds to the buyer.
    ///
    /// A missing or already settled escrow is a no-op.
    pub fn refund(&self, errand_id: &ErrandId, now: DateTime<Utc>) -> Outcome<Option<Escrow>> {
        let escrow = {
            let mut escrows = self.escrows.write();
            let Some(escrow) = escrows.get_mut(errand_id) else {
                debug!(errand_id = %errand_id, "no escrow to refund");
                return Outcome::new(None).with_effect(SideEffect::EscrowUnchanged {
                    reason: "no escrow".into(),
                });
            };
            if escrow.transition_to(EscrowStatus::Refunded).is_err() {
                info!(escrow_id = %escrow.id, status = %escrow.status, "escrow not refundable");
                return Outcome::new(Some(escrow.clone())).with_effect(
                    SideEffect::EscrowUnchanged {
                        reason: format!("escrow is {}", escrow.status),
                    },
                );
            }
            escrow.refunded_at = Some(now);
            escrow.clone()
        };

        info!(escrow_id = %escrow.id, errand_id = %errand_id, amount = escrow.amount, "escrow refunded");

        let mut effects = vec![SideEffect::EscrowRefunded {
            escrow_id: escrow.id.clone(),
            amount: escrow.amount,
        }];
        if let Err(error) = self
            .gateway
            .refund(escrow.transaction_id.as_ref(), escrow.amount)
        {
            warn!(escrow_id = %escrow.id, error = %error, "refund failed");
            effects.push(SideEffect::GatewayFailed {
                operation: "refund",
                error,
            });
        }

        Outcome {
            primary: Some(escrow),
            side_effects: effects,
        }
    }

    /// Voids a PENDING escrow without moving funds.
    ///
    /// # Errors
    ///
    /// - [`MarketError::EscrowNotFound`] if the errand has no escrow
    /// - [`MarketError::InvalidTransition`] if the escrow is settled
    pub fn cancel(&self, errand_id: &ErrandId) -> Result<Escrow> {
        let mut escrows = self.escrows.write();
        let escrow = escrows
            .get_mut(errand_id)
            .ok_or_else(|| MarketError::EscrowNotFound(errand_id.to_string()))?;
        escrow.transition_to(EscrowStatus::Cancelled)?;
        info!(escrow_id = %escrow.id, errand_id = %errand_id, "escrow cancelled");
        Ok(escrow.clone())
    }

    /// Gets the escrow for an errand.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::EscrowNotFound`] if there is none.
    pub fn get(&self, errand_id: &ErrandId) -> Result<Escrow> {
        self.escrows
            .read()
            .get(errand_id)
            .cloned()
            .ok_or_else(|| MarketError::EscrowNotFound(errand_id.to_string()))
    }

    /// Status of the errand's escrow, if any.
    #[must_use]
    pub fn status_for(&self, errand_id: &ErrandId) -> Option<EscrowStatus> {
        self.escrows.read().get(errand_id).map(|e| e.status)
    }

    /// Number of escrows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.escrows.read().len()
    }

    /// Returns true if there are no escrows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.escrows.read().is_empty()
    }
}
