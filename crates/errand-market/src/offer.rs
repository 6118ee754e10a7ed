//! Offer book for errand matching.
//!
//! Tracks time-bounded offers made to runners and resolves the
//! accept/reject/expire races between them. All mutations run under a single
//! book lock, so a response and a sweep on the same offer are linearized,
//! and accepting one offer expires its pending siblings atomically.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MarketError, Result};
use crate::ranking::RunnerCandidate;
use crate::types::{Coordinate, ErrandId, OfferId, UserId};

/// The status of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    /// Waiting for the runner.
    Pending,
    /// The runner took the errand.
    Accepted,
    /// The runner declined.
    Rejected,
    /// Timed out, or a sibling offer won.
    Expired,
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// A runner's answer to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Take the errand.
    Accept,
    /// Pass on the errand.
    Reject,
}

/// An offer of one errand to one runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Unique identifier.
    pub id: OfferId,
    /// The errand on offer.
    pub errand_id: ErrandId,
    /// The runner asked.
    pub runner_id: UserId,
    /// Rank position, starting at 1.
    pub position: u32,
    /// Current status.
    pub status: OfferStatus,
    /// Where the runner was when ranked.
    pub runner_location: Option<Coordinate>,
    /// When the offer was first made.
    pub created_at: DateTime<Utc>,
    /// Answer deadline.
    pub expires_at: DateTime<Utc>,
    /// When the runner answered.
    pub responded_at: Option<DateTime<Utc>>,
}

impl Offer {
    /// Returns true if the runner can still answer.
    #[must_use]
    pub fn is_actionable(&self, now: DateTime<Utc>) -> bool {
        self.status == OfferStatus::Pending && now < self.expires_at
    }
}

/// Result of a successful [`OfferBook::respond`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The answered offer.
    pub offer: Offer,
    /// Pending siblings expired by an acceptance.
    pub expired_siblings: Vec<OfferId>,
}

#[derive(Debug, Default)]
struct Inner {
    offers: HashMap<OfferId, Offer>,
    by_runner: HashMap<(ErrandId, UserId), OfferId>,
}

impl Inner {
    fn has_accepted(&self, errand_id: &ErrandId) -> bool {
        self.offers
            .values()
            .any(|o| &o.errand_id == errand_id && o.status == OfferStatus::Accepted)
    }

    fn expire_where(&mut self, pred: impl Fn(&Offer) -> bool) -> Vec<OfferId> {
        let mut expired = Vec::new();
        for offer in self.offers.values_mut() {
            if offer.status == OfferStatus::Pending && pred(offer) {
                offer.status = OfferStatus::Expired;
                expired.push(offer.id.clone());
            }
        }
        expired
    }
}

/// Store of offers, keyed by id and unique per (errand, runner).
#[derive(Debug, Default)]
pub struct OfferBook {
    inner: RwLock<Inner>,
}

impl OfferBook {
    /// Creates an empty offer book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes or refreshes an offer to a ranked runner.
    ///
    /// An existing offer for the same (errand, runner) is reset to PENDING
    /// with a new deadline instead of creating a second record.
    ///
    /// # Errors
    ///
    /// - [`MarketError::InvalidTransition`] if an offer for the errand has
    ///   already been accepted
    /// - [`MarketError::Config`] if `now + ttl` is out of range
    pub fn send(
        &self,
        errand_id: &ErrandId,
        candidate: &RunnerCandidate,
        position: u32,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Offer> {
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            MarketError::Config(format!("offer ttl {ttl} after {now} is out of range"))
        })?;

        let mut inner = self.inner.write();
        if inner.has_accepted(errand_id) {
            return Err(MarketError::invalid_transition(
                OfferStatus::Accepted,
                OfferStatus::Pending,
            ));
        }

        let key = (errand_id.clone(), candidate.runner_id.clone());

        let existing = match inner.by_runner.get(&key).cloned() {
            Some(id) => inner.offers.get_mut(&id),
            None => None,
        };
        if let Some(existing) = existing {
            existing.status = OfferStatus::Pending;
            existing.position = position;
            existing.runner_location = candidate.location;
            existing.expires_at = expires_at;
            existing.responded_at = None;
            debug!(
                offer_id = %existing.id,
                errand_id = %errand_id,
                runner_id = %candidate.runner_id,
                "offer refreshed"
            );
            return Ok(existing.clone());
        }

        let offer = Offer {
            id: OfferId::generate(),
            errand_id: errand_id.clone(),
            runner_id: candidate.runner_id.clone(),
            position,
            status: OfferStatus::Pending,
            runner_location: candidate.location,
            created_at: now,
            expires_at,
            responded_at: None,
        };
        inner.by_runner.insert(key, offer.id.clone());
        inner.offers.insert(offer.id.clone(), offer.clone());

        debug!(
            offer_id = %offer.id,
            errand_id = %errand_id,
            runner_id = %offer.runner_id,
            position,
            expires_at = %offer.expires_at,
            "offer sent"
        );
        Ok(offer)
    }

    /// Records a runner's answer.
    ///
    /// # Errors
    ///
    /// - [`MarketError::OfferNotFound`] if no PENDING offer matches the id and runner
    /// - [`MarketError::OfferExpired`] if the deadline has passed; the offer
    ///   is marked EXPIRED before returning
    pub fn respond(
        &self,
        offer_id: &OfferId,
        runner_id: &UserId,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<Response> {
        let mut inner = self.inner.write();

        let offer = inner
            .offers
            .get_mut(offer_id)
            .filter(|o| &o.runner_id == runner_id && o.status == OfferStatus::Pending)
            .ok_or_else(|| MarketError::OfferNotFound(offer_id.to_string()))?;

        if now >= offer.expires_at {
            offer.status = OfferStatus::Expired;
            info!(offer_id = %offer_id, runner_id = %runner_id, "offer expired before response");
            return Err(MarketError::OfferExpired(offer_id.to_string()));
        }

        offer.responded_at = Some(now);
        let errand_id = offer.errand_id.clone();

        match decision {
            Decision::Reject => {
                offer.status = OfferStatus::Rejected;
                let offer = offer.clone();
                info!(offer_id = %offer_id, errand_id = %errand_id, runner_id = %runner_id, "offer rejected");
                Ok(Response {
                    offer,
                    expired_siblings: Vec::new(),
                })
            }
            Decision::Accept => {
                offer.status = OfferStatus::Accepted;
                let offer = offer.clone();
                let expired_siblings =
                    inner.expire_where(|o| o.errand_id == errand_id && &o.id != offer_id);
                info!(
                    offer_id = %offer_id,
                    errand_id = %errand_id,
                    runner_id = %runner_id,
                    siblings_expired = expired_siblings.len(),
                    "offer accepted"
                );
                Ok(Response {
                    offer,
                    expired_siblings,
                })
            }
        }
    }

    /// Expires every PENDING offer whose deadline has passed.
    ///
    /// Returns how many offers changed. Idempotent.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let expired = self.inner.write().expire_where(|o| o.expires_at <= now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale offers");
        }
        expired.len()
    }

    /// Expires every PENDING offer of an errand, regardless of deadline.
    pub fn expire_pending_for_errand(&self, errand_id: &ErrandId) -> usize {
        let expired = self
            .inner
            .write()
            .expire_where(|o| &o.errand_id == errand_id);
        expired.len()
    }

    /// Gets an offer by ID.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::OfferNotFound`] if it does not exist.
    pub fn get(&self, offer_id: &OfferId) -> Result<Offer> {
        self.inner
            .read()
            .offers
            .get(offer_id)
            .cloned()
            .ok_or_else(|| MarketError::OfferNotFound(offer_id.to_string()))
    }

    /// All offers for an errand, by rank position.
    #[must_use]
    pub fn offers_for_errand(&self, errand_id: &ErrandId) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .inner
            .read()
            .offers
            .values()
            .filter(|o| &o.errand_id == errand_id)
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.position);
        offers
    }

    /// Offers a runner can still answer, soonest deadline first.
    #[must_use]
    pub fn pending_for_runner(&self, runner_id: &UserId, now: DateTime<Utc>) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .inner
            .read()
            .offers
            .values()
            .filter(|o| &o.runner_id == runner_id && o.is_actionable(now))
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.expires_at);
        offers
    }

    /// The accepted offer for an errand, if any.
    #[must_use]
    pub fn accepted_for_errand(&self, errand_id: &ErrandId) -> Option<Offer> {
        self.inner
            .read()
            .offers
            .values()
            .find(|o| &o.errand_id == errand_id && o.status == OfferStatus::Accepted)
            .cloned()
    }

    /// Total number of offers ever made.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().offers.len()
    }

    /// Returns true if no offers exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().offers.is_empty()
    }
}
