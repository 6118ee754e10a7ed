//! The marketplace facade.
//!
//! [`Marketplace`] owns the errand book, offer book, escrow ledger and trust
//! ledger, and exposes the operations clients call. It dispatches every
//! committed errand [`StatusChange`] to the escrow ledger and wakes the
//! matching task of the errand involved.
//!
//! All mutations of one errand (offer send and accept, cancel, complete,
//! expiry) run inside that errand's critical section ([`ErrandLocks`]), so
//! the accept/cancel/expire races resolve to exactly one winner. No lock is
//! held across an `.await`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MarketConfig;
use crate::errand::{Errand, ErrandBook, NewErrand, StatusChange, Transition};
use crate::error::{MarketError, Result};
use crate::escrow::{EscrowLedger, EscrowStatus};
use crate::matching::{self, MatchReport};
use crate::offer::{Decision, Offer, OfferBook};
use crate::outcome::{Outcome, SideEffect};
use crate::ports::{CandidateSource, Clock, LoggingNotifier, Notifier, PaymentGateway, SystemClock};
use crate::ranking::{self, RunnerCandidate};
use crate::trust::{Rating, TrustLedger};
use crate::types::{ErrandId, OfferId, UserId};

/// How many nearby runners a status poll reports.
pub const STATUS_NEARBY_LIMIT: usize = 10;

/// Who is asking to complete or cancel an errand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The errand's buyer.
    Buyer(UserId),
    /// A runner.
    Runner(UserId),
}

impl Actor {
    /// The acting user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        match self {
            Self::Buyer(id) | Self::Runner(id) => id,
        }
    }
}

/// Per-errand critical sections.
#[derive(Debug, Default)]
pub struct ErrandLocks {
    locks: Mutex<HashMap<ErrandId, Arc<Mutex<()>>>>,
}

impl ErrandLocks {
    /// Runs `f` while holding the errand's lock.
    pub fn with<R>(&self, errand_id: &ErrandId, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(errand_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _guard = lock.lock();
        f()
    }

    /// Drops the lock of an errand that reached a terminal status.
    pub fn forget(&self, errand_id: &ErrandId) {
        self.locks.lock().remove(errand_id);
    }

    /// Number of live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Returns true if no locks are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Wake-up signals for running matching tasks, one per errand.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    inner: Mutex<HashMap<ErrandId, Arc<Notify>>>,
}

impl Signals {
    /// Claims the errand for one matching task. Returns `None` if another
    /// task already holds it.
    pub(crate) fn register(&self, errand_id: &ErrandId) -> Option<Arc<Notify>> {
        match self.inner.lock().entry(errand_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(Arc::clone(slot.insert(Arc::new(Notify::new())))),
        }
    }

    pub(crate) fn remove(&self, errand_id: &ErrandId) {
        self.inner.lock().remove(errand_id);
    }

    fn wake(&self, errand_id: &ErrandId) {
        if let Some(signal) = self.inner.lock().get(errand_id) {
            signal.notify_one();
        }
    }

    fn wake_all(&self) {
        for signal in self.inner.lock().values() {
            signal.notify_one();
        }
    }
}

/// Result of answering an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferReply {
    /// The offer after the answer.
    pub offer: Offer,
    /// The errand after the answer.
    pub errand: Errand,
}

/// What a status poll returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrandStatusView {
    /// Errand snapshot.
    pub errand: Errand,
    /// Escrow status, once one exists.
    pub escrow_status: Option<EscrowStatus>,
    /// Offers still awaiting an answer.
    pub pending_offers: usize,
    /// Closest eligible runners while the errand is PENDING.
    pub nearby_runners: Vec<RunnerCandidate>,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Offers expired by deadline.
    pub offers_expired: usize,
    /// Errands expired by deadline.
    pub errands_expired: usize,
}

/// The errand marketplace.
pub struct Marketplace {
    config: MarketConfig,
    errands: ErrandBook,
    offers: OfferBook,
    escrows: EscrowLedger,
    trust: Arc<TrustLedger>,
    candidates: Arc<dyn CandidateSource>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    locks: ErrandLocks,
    signals: Signals,
}

impl std::fmt::Debug for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marketplace")
            .field("config", &self.config)
            .field("errands", &self.errands.len())
            .field("offers", &self.offers.len())
            .field("escrows", &self.escrows.len())
            .finish_non_exhaustive()
    }
}

impl Marketplace {
    /// Creates a marketplace with a logging notifier, the system clock and
    /// an empty trust ledger.
    #[must_use]
    pub fn new(
        config: MarketConfig,
        candidates: Arc<dyn CandidateSource>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            errands: ErrandBook::new(config.pricing),
            offers: OfferBook::new(),
            escrows: EscrowLedger::new(gateway),
            trust: Arc::new(TrustLedger::new()),
            candidates,
            notifier: Arc::new(LoggingNotifier),
            clock: Arc::new(SystemClock),
            locks: ErrandLocks::default(),
            signals: Signals::default(),
            config,
        }
    }

    /// Sets the offer notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shares an existing trust ledger.
    #[must_use]
    pub fn with_trust(mut self, trust: Arc<TrustLedger>) -> Self {
        self.trust = trust;
        self
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &MarketConfig {
        &self.config
    }

    /// The errand book.
    #[must_use]
    pub const fn errands(&self) -> &ErrandBook {
        &self.errands
    }

    /// The offer book.
    #[must_use]
    pub const fn offers(&self) -> &OfferBook {
        &self.offers
    }

    /// The escrow ledger.
    #[must_use]
    pub const fn escrows(&self) -> &EscrowLedger {
        &self.escrows
    }

    /// The trust ledger.
    #[must_use]
    pub fn trust(&self) -> &Arc<TrustLedger> {
        &self.trust
    }

    /// Current time per the configured clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn candidates(&self) -> &dyn CandidateSource {
        self.candidates.as_ref()
    }

    pub(crate) fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub(crate) const fn signals(&self) -> &Signals {
        &self.signals
    }

    // ========================================================================
    // Client operations
    // ========================================================================

    /// Posts a new PENDING errand.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidErrand`] if the request is invalid.
    pub fn create_errand(&self, request: NewErrand) -> Result<Outcome<Errand>> {
        let errand = self
            .errands
            .create(request, self.now(), self.config.errand_ttl()?)?;
        Ok(Outcome::new(errand))
    }

    /// Spawns the matching task for an errand and returns its handle.
    pub fn start_matching(self: &Arc<Self>, errand_id: ErrandId) -> JoinHandle<MatchReport> {
        let market = Arc::clone(self);
        tokio::spawn(async move { market.run_matching(&errand_id).await })
    }

    /// Runs matching for an errand to completion.
    pub async fn run_matching(&self, errand_id: &ErrandId) -> MatchReport {
        matching::run(self, errand_id).await
    }

    /// Records a runner's answer to an offer.
    ///
    /// # Errors
    ///
    /// - [`MarketError::OfferNotFound`] if no pending offer matches the id and runner
    /// - [`MarketError::OfferExpired`] if the offer deadline has passed
    /// - [`MarketError::ErrandExpired`] if the errand is no longer open
    pub fn respond_to_offer(
        &self,
        offer_id: &OfferId,
        runner_id: &UserId,
        decision: Decision,
    ) -> Result<Outcome<OfferReply>> {
        let offer = self.offers.get(offer_id)?;
        if &offer.runner_id != runner_id {
            return Err(MarketError::OfferNotFound(offer_id.to_string()));
        }
        let errand_id = offer.errand_id;

        let result: Result<Outcome<OfferReply>> = self.locked(&errand_id, || {
            let now = self.now();
            let mut effects = self
                .expire_if_due_locked(&errand_id, now)?
                .map(|o| o.side_effects)
                .unwrap_or_default();

            let errand = self.errands.get(&errand_id)?;
            if decision == Decision::Accept && !errand.is_matchable() {
                return Err(MarketError::ErrandExpired(errand_id.to_string()));
            }

            let response = self.offers.respond(offer_id, runner_id, decision, now)?;
            if !response.expired_siblings.is_empty() {
                effects.push(SideEffect::OffersExpired {
                    count: response.expired_siblings.len(),
                });
            }

            let errand = match decision {
                Decision::Reject => errand,
                Decision::Accept => {
                    let transition = self
                        .errands
                        .accept(&errand_id, runner_id, response.offer.runner_location, now)
                        .inspect_err(|e| {
                            warn!(errand_id = %errand_id, error = %e, "accepted offer could not assign errand");
                        })?;
                    effects.extend(self.dispatch(&transition.change, &transition.errand, now));
                    transition.errand
                }
            };

            Ok(Outcome {
                primary: OfferReply {
                    offer: response.offer,
                    errand,
                },
                side_effects: effects,
            })
        });

        // Any answer, including a late one, changes what the matcher waits on.
        self.signals.wake(&errand_id);
        result
    }

    /// Returns the errand's current state, expiring it first if due.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::ErrandNotFound`] if the errand does not exist.
    pub fn get_errand_status(&self, errand_id: &ErrandId) -> Result<ErrandStatusView> {
        let now = self.now();
        let expired = self.locked(errand_id, || self.expire_if_due_locked(errand_id, now))?;
        if let Some(outcome) = expired {
            debug!(errand_id = %errand_id, effects = outcome.side_effects.len(), "lazy expiry on status poll");
        }

        let errand = self.errands.get(errand_id)?;
        let pending_offers = self
            .offers
            .offers_for_errand(errand_id)
            .iter()
            .filter(|o| o.is_actionable(now))
            .count();

        let nearby_runners = if errand.is_matchable() {
            match self.candidates.nearby_runners(&errand) {
                Ok(candidates) => {
                    let mut ranked = ranking::rank(&errand, candidates);
                    ranked.truncate(STATUS_NEARBY_LIMIT);
                    ranked
                }
                Err(e) => {
                    warn!(errand_id = %errand_id, error = %e, "nearby runner lookup failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(ErrandStatusView {
            escrow_status: self.escrows.status_for(errand_id),
            errand,
            pending_offers,
            nearby_runners,
        })
    }

    /// Marks an errand done and releases its escrow.
    ///
    /// # Errors
    ///
    /// - [`MarketError::Unauthorized`] unless the actor is the buyer or the
    ///   assigned runner
    /// - [`MarketError::InvalidTransition`] unless the errand is IN_PROGRESS
    pub fn complete_errand(&self, errand_id: &ErrandId, actor: &Actor) -> Result<Outcome<Errand>> {
        self.locked(errand_id, || {
            let errand = self.errands.get(errand_id)?;
            let permitted = match actor {
                Actor::Buyer(id) => id == &errand.buyer_id,
                Actor::Runner(id) => errand.assigned_runner_id.as_ref() == Some(id),
            };
            if !permitted {
                return Err(MarketError::Unauthorized(format!(
                    "{} cannot complete errand {errand_id}",
                    actor.user_id()
                )));
            }

            let transition = self.errands.complete(errand_id)?;
            Ok(self.finish(transition, self.now()))
        })
    }

    /// Cancels an errand, refunding any escrow.
    ///
    /// # Errors
    ///
    /// - [`MarketError::Unauthorized`] unless the actor is the buyer
    /// - [`MarketError::InvalidTransition`] from a terminal status
    pub fn cancel_errand(&self, errand_id: &ErrandId, actor: &Actor) -> Result<Outcome<Errand>> {
        let result: Result<Outcome<Errand>> = self.locked(errand_id, || {
            let errand = self.errands.get(errand_id)?;
            match actor {
                Actor::Buyer(id) if id == &errand.buyer_id => {}
                _ => {
                    return Err(MarketError::Unauthorized(format!(
                        "{} cannot cancel errand {errand_id}",
                        actor.user_id()
                    )));
                }
            }

            let transition = self.errands.cancel(errand_id)?;
            Ok(self.finish(transition, self.now()))
        });
        self.signals.wake(errand_id);
        result
    }

    /// Offers a runner can still answer, soonest deadline first.
    #[must_use]
    pub fn pending_offers(&self, runner_id: &UserId) -> Vec<Offer> {
        self.offers.pending_for_runner(runner_id, self.now())
    }

    /// Rates the other party of a completed errand.
    ///
    /// # Errors
    ///
    /// See [`TrustLedger::record_rating`].
    pub fn rate(
        &self,
        errand_id: &ErrandId,
        rater_id: &UserId,
        ratee_id: &UserId,
        score: u8,
        comment: Option<String>,
    ) -> Result<Outcome<Rating>> {
        let errand = self.errands.get(errand_id)?;
        let (rating, event) =
            self.trust
                .record_rating(&errand, rater_id, ratee_id, score, comment, self.now())?;
        let old = (i16::from(event.score) - event.delta).clamp(0, i16::from(u8::MAX)) as u8;
        Ok(Outcome::new(rating).with_effect(SideEffect::TrustUpdated {
            user_id: event.user_id,
            old,
            new: event.score,
        }))
    }

    /// Expires stale offers and overdue errands, then wakes matchers.
    pub fn sweep(&self) -> Outcome<SweepReport> {
        let now = self.now();
        let mut outcome = Outcome::new(SweepReport {
            offers_expired: self.offers.expire_stale(now),
            errands_expired: 0,
        });

        for errand_id in self.errands.due_for_expiry(now) {
            match self.locked(&errand_id, || self.expire_if_due_locked(&errand_id, now)) {
                Ok(Some(expired)) => {
                    outcome.primary.errands_expired += 1;
                    outcome.extend(expired.side_effects);
                }
                Ok(None) => {}
                Err(e) => warn!(errand_id = %errand_id, error = %e, "sweep expiry failed"),
            }
        }

        if outcome.primary.offers_expired > 0 || outcome.primary.errands_expired > 0 {
            info!(
                offers_expired = outcome.primary.offers_expired,
                errands_expired = outcome.primary.errands_expired,
                "sweep"
            );
            self.signals.wake_all();
        }
        outcome
    }

    // ========================================================================
    // Matching support
    // ========================================================================

    /// Sends an offer if the errand is still matchable.
    pub(crate) fn issue_offer(
        &self,
        errand_id: &ErrandId,
        candidate: &RunnerCandidate,
        position: u32,
    ) -> Result<Offer> {
        self.locked(errand_id, || {
            let errand = self.errands.get(errand_id)?;
            if !errand.is_matchable() {
                return Err(MarketError::ErrandExpired(errand_id.to_string()));
            }
            self.offers
                .send(errand_id, candidate, position, self.config.offer_ttl()?, self.now())
        })
    }

    /// Expires a PENDING errand that ran out of runners.
    pub(crate) fn expire_unmatched(&self, errand_id: &ErrandId) -> Result<Outcome<Errand>> {
        self.locked(errand_id, || {
            let transition = self.errands.expire_no_runners(errand_id)?;
            info!(errand_id = %errand_id, "no runner accepted, errand expired");
            Ok(self.finish(transition, self.now()))
        })
    }

    /// Expires the errand if its deadline passed.
    pub(crate) fn expire_if_due(&self, errand_id: &ErrandId) -> Result<Option<Outcome<Errand>>> {
        let now = self.now();
        self.locked(errand_id, || self.expire_if_due_locked(errand_id, now))
    }

    // ========================================================================
    // Internals (callers hold the errand lock)
    // ========================================================================

    /// Runs `f` inside the errand's critical section.
    ///
    /// Unknown errands fail before a lock is allocated. Terminal errands
    /// never change again, so they are read without one, and the lock of an
    /// errand that ends terminal is dropped on the way out.
    fn locked<R>(&self, errand_id: &ErrandId, f: impl FnOnce() -> Result<R>) -> Result<R> {
        if self.errands.get(errand_id)?.status.is_terminal() {
            return f();
        }
        let result = self.locks.with(errand_id, f);
        if self
            .errands
            .get(errand_id)
            .is_ok_and(|e| e.status.is_terminal())
        {
            self.locks.forget(errand_id);
        }
        result
    }

    fn expire_if_due_locked(
        &self,
        errand_id: &ErrandId,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome<Errand>>> {
        Ok(self
            .errands
            .expire_if_due(errand_id, now)?
            .map(|t| self.finish(t, now)))
    }

    /// Side effects of a status change: retire offers, settle escrow, wake
    /// the matcher.
    fn finish(&self, transition: Transition, now: DateTime<Utc>) -> Outcome<Errand> {
        let Transition { change, errand } = transition;
        let mut outcome = Outcome::new(errand);

        let retired = self.offers.expire_pending_for_errand(&change.errand_id);
        if retired > 0 {
            outcome.extend([SideEffect::OffersExpired { count: retired }]);
        }
        outcome.extend(self.dispatch(&change, &outcome.primary, now));
        self.signals.wake(&change.errand_id);
        outcome
    }

    fn dispatch(&self, change: &StatusChange, errand: &Errand, now: DateTime<Utc>) -> Vec<SideEffect> {
        let effects = self.escrows.on_status_change(change, errand, now);
        for effect in effects.iter().filter(|e| e.is_failure()) {
            warn!(errand_id = %change.errand_id, effect = ?effect, "status change side effect failed");
        }
        effects
    }
}
