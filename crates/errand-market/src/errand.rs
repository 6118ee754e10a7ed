//! Errand records and the errand status state machine.
//!
//! ```text
//! PENDING ──accept──▶ IN_PROGRESS ──complete──▶ COMPLETED
//!    │                     │
//!    ├──cancel─────────────┴──cancel──▶ CANCELLED
//!    │
//!    └──expire (no runners | deadline)──▶ EXPIRED
//! ```
//!
//! COMPLETED, CANCELLED and EXPIRED are terminal. Every successful
//! transition yields a [`Transition`] carrying the tagged [`StatusChange`]
//! that downstream handlers (escrow) consume.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PricingConfig;
use crate::error::{MarketError, Result};
use crate::geo::distance_km;
use crate::pricing::{self, Quote};
use crate::types::{Coordinate, ErrandId, Task, UserId};

/// The status of an errand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrandStatus {
    /// Open, searching for runners.
    Pending,
    /// Accepted by a runner.
    InProgress,
    /// Finished by the runner.
    Completed,
    /// Called off by the buyer.
    Cancelled,
    /// Deadline passed before the errand finished.
    Expired,
}

impl ErrandStatus {
    /// Checks if a transition to the target status is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        use ErrandStatus::{Cancelled, Completed, Expired, InProgress, Pending};

        matches!(
            (self, target),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (Pending | InProgress, Cancelled)
                | (Pending | InProgress, Expired)
        )
    }

    /// Returns true for COMPLETED, CANCELLED and EXPIRED.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }
}

impl std::fmt::Display for ErrandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// A buyer's request to post an errand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewErrand {
    /// Who posts and pays.
    pub buyer_id: UserId,
    /// Where the runner goes.
    pub go_to: Coordinate,
    /// Optional drop-off point.
    pub return_to: Option<Coordinate>,
    /// Priced tasks, in order.
    pub tasks: Vec<Task>,
    /// Explicit matching deadline. Defaults to now + errand TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewErrand {
    /// Creates a request with no return point and the default deadline.
    #[must_use]
    pub fn new(buyer_id: UserId, go_to: Coordinate, tasks: Vec<Task>) -> Self {
        Self {
            buyer_id,
            go_to,
            return_to: None,
            tasks,
            expires_at: None,
        }
    }

    /// Sets the drop-off point.
    #[must_use]
    pub fn with_return_to(mut self, return_to: Coordinate) -> Self {
        self.return_to = Some(return_to);
        self
    }

    /// Sets an explicit deadline.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidErrand`] when there are no tasks, a task
    /// has no description, or the pickup point is not a valid coordinate.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(MarketError::InvalidErrand(
                "at least one task is required".into(),
            ));
        }
        if let Some(idx) = self.tasks.iter().position(|t| t.description.trim().is_empty()) {
            return Err(MarketError::InvalidErrand(format!(
                "task {} has no description",
                idx + 1
            )));
        }
        if !self.go_to.is_valid() {
            return Err(MarketError::InvalidErrand("invalid go_to location".into()));
        }
        if self.return_to.is_some_and(|c| !c.is_valid()) {
            return Err(MarketError::InvalidErrand(
                "invalid return_to location".into(),
            ));
        }
        Ok(())
    }
}

/// A unit of work requested by a buyer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Errand {
    /// Unique identifier.
    pub id: ErrandId,
    /// Who posted it.
    pub buyer_id: UserId,
    /// Current status.
    pub status: ErrandStatus,
    /// Whether runners may still accept it.
    pub is_open: bool,
    /// When it was created.
    pub created_at: DateTime<Utc>,
    /// Matching deadline.
    pub expires_at: Option<DateTime<Utc>>,
    /// Runner holding the errand (IN_PROGRESS and COMPLETED only).
    pub assigned_runner_id: Option<UserId>,
    /// When a runner accepted.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Pickup point.
    pub go_to: Coordinate,
    /// Optional drop-off point.
    pub return_to: Option<Coordinate>,
    /// Priced tasks.
    pub tasks: Vec<Task>,
    /// Distance fee fixed at acceptance.
    pub quoted_distance_fee: u64,
    /// Service fee fixed at acceptance.
    pub quoted_service_fee: u64,
    /// Total price fixed at acceptance.
    pub quoted_total_price: u64,
}

impl Errand {
    /// Builds a PENDING errand from a request.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidErrand`] if `now + ttl` is not a
    /// representable instant.
    pub fn from_request(
        request: NewErrand,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Self> {
        let expires_at = match request.expires_at {
            Some(at) => at,
            None => now.checked_add_signed(ttl).ok_or_else(|| {
                MarketError::InvalidErrand(format!("deadline {ttl} after {now} is out of range"))
            })?,
        };
        Ok(Self {
            id: ErrandId::generate(),
            buyer_id: request.buyer_id,
            status: ErrandStatus::Pending,
            is_open: true,
            created_at: now,
            expires_at: Some(expires_at),
            assigned_runner_id: None,
            accepted_at: None,
            go_to: request.go_to,
            return_to: request.return_to,
            tasks: request.tasks,
            quoted_distance_fee: 0,
            quoted_service_fee: 0,
            quoted_total_price: 0,
        })
    }

    /// Returns true if runners can still be matched.
    #[must_use]
    pub fn is_matchable(&self) -> bool {
        self.status == ErrandStatus::Pending && self.is_open
    }

    /// Returns true if the errand deadline has passed.
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// The quote fixed at acceptance (all zero before).
    #[must_use]
    pub fn quote(&self) -> Quote {
        Quote {
            errand_value: pricing::errand_value(&self.tasks),
            service_fee: self.quoted_service_fee,
            distance_fee: self.quoted_distance_fee,
            total: self.quoted_total_price,
        }
    }
}

/// Tagged record of a committed errand status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// The errand that moved.
    pub errand_id: ErrandId,
    /// Status before.
    pub from: ErrandStatus,
    /// Status after.
    pub to: ErrandStatus,
    /// Runner involved: the accepting runner, or the runner that held the
    /// errand when it ended.
    pub runner_id: Option<UserId>,
}

/// A committed transition: the change plus the errand as it now stands.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The status change.
    pub change: StatusChange,
    /// Snapshot after the change.
    pub errand: Errand,
}

/// Owner of errand records and the only writer of their status fields.
#[derive(Debug, Default)]
pub struct ErrandBook {
    errands: RwLock<HashMap<ErrandId, Errand>>,
    pricing: PricingConfig,
}

impl ErrandBook {
    /// Creates an empty book with the given pricing rates.
    #[must_use]
    pub fn new(pricing: PricingConfig) -> Self {
        Self {
            errands: RwLock::new(HashMap::new()),
            pricing,
        }
    }

    /// Validates and stores a new PENDING errand.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidErrand`] if the request is invalid.
    pub fn create(
        &self,
        request: NewErrand,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Errand> {
        request.validate()?;
        let errand = Errand::from_request(request, now, ttl)?;
        info!(
            errand_id = %errand.id,
            buyer_id = %errand.buyer_id,
            tasks = errand.tasks.len(),
            expires_at = ?errand.expires_at,
            "errand created"
        );
        self.errands.write().insert(errand.id.clone(), errand.clone());
        Ok(errand)
    }

    /// Gets an errand by ID.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::ErrandNotFound`] if it does not exist.
    pub fn get(&self, errand_id: &ErrandId) -> Result<Errand> {
        self.errands
            .read()
            .get(errand_id)
            .cloned()
            .ok_or_else(|| MarketError::ErrandNotFound(errand_id.to_string()))
    }

    /// Returns the number of stored errands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errands.read().len()
    }

    /// Returns true if there are no errands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errands.read().is_empty()
    }

    /// Returns non-terminal errands whose deadline has passed.
    #[must_use]
    pub fn due_for_expiry(&self, now: DateTime<Utc>) -> Vec<ErrandId> {
        self.errands
            .read()
            .values()
            .filter(|e| !e.status.is_terminal() && e.is_past_deadline(now))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Hands the errand to a runner and fixes its price.
    ///
    /// # Errors
    ///
    /// - [`MarketError::InvalidTransition`] unless the errand is PENDING and open
    /// - [`MarketError::ErrandExpired`] if the matching deadline has passed
    pub fn accept(
        &self,
        errand_id: &ErrandId,
        runner_id: &UserId,
        runner_location: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut errands = self.errands.write();
        let errand = errands
            .get_mut(errand_id)
            .ok_or_else(|| MarketError::ErrandNotFound(errand_id.to_string()))?;

        if !errand.is_matchable() {
            return Err(MarketError::invalid_transition(
                errand.status,
                ErrandStatus::InProgress,
            ));
        }
        if errand.is_past_deadline(now) {
            return Err(MarketError::ErrandExpired(errand_id.to_string()));
        }

        let km = distance_km(runner_location, Some(errand.go_to));
        if !km.is_finite() {
            warn!(
                errand_id = %errand_id,
                runner_id = %runner_id,
                "runner location unusable, distance fee set to zero"
            );
        }
        let quote = pricing::quote(&errand.tasks, km, &self.pricing);

        let from = errand.status;
        errand.status = ErrandStatus::InProgress;
        errand.is_open = false;
        errand.assigned_runner_id = Some(runner_id.clone());
        errand.accepted_at = Some(now);
        errand.quoted_distance_fee = quote.distance_fee;
        errand.quoted_service_fee = quote.service_fee;
        errand.quoted_total_price = quote.total;

        info!(
            errand_id = %errand_id,
            runner_id = %runner_id,
            errand_value = quote.errand_value,
            service_fee = quote.service_fee,
            distance_fee = quote.distance_fee,
            total = quote.total,
            "errand accepted"
        );

        Ok(Transition {
            change: StatusChange {
                errand_id: errand_id.clone(),
                from,
                to: ErrandStatus::InProgress,
                runner_id: Some(runner_id.clone()),
            },
            errand: errand.clone(),
        })
    }

    /// Marks an IN_PROGRESS errand as done.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidTransition`] unless the errand is IN_PROGRESS.
    pub fn complete(&self, errand_id: &ErrandId) -> Result<Transition> {
        self.transition(errand_id, None, ErrandStatus::Completed, |_| {})
    }

    /// Cancels a PENDING or IN_PROGRESS errand.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidTransition`] from a terminal status.
    pub fn cancel(&self, errand_id: &ErrandId) -> Result<Transition> {
        self.transition(errand_id, None, ErrandStatus::Cancelled, |e| {
            e.assigned_runner_id = None;
        })
    }

    /// Expires a PENDING errand because no runner could be matched.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidTransition`] unless the errand is PENDING.
    pub fn expire_no_runners(&self, errand_id: &ErrandId) -> Result<Transition> {
        self.transition(
            errand_id,
            Some(ErrandStatus::Pending),
            ErrandStatus::Expired,
            |_| {},
        )
    }

    /// Expires a PENDING or IN_PROGRESS errand whose deadline has passed.
    ///
    /// Safe to call from any reader: returns `Ok(None)` when nothing is due
    /// or the errand is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::ErrandNotFound`] if the errand does not exist.
    pub fn expire_if_due(
        &self,
        errand_id: &ErrandId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        {
            let errands = self.errands.read();
            let errand = errands
                .get(errand_id)
                .ok_or_else(|| MarketError::ErrandNotFound(errand_id.to_string()))?;
            if errand.status.is_terminal() || !errand.is_past_deadline(now) {
                return Ok(None);
            }
        }

        // Re-checked under the write lock; a concurrent writer may have won.
        match self.transition(errand_id, None, ErrandStatus::Expired, |_| {}) {
            Ok(t) => Ok(Some(t)),
            Err(MarketError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Applies `to`, optionally only from one specific status.
    fn transition(
        &self,
        errand_id: &ErrandId,
        only_from: Option<ErrandStatus>,
        to: ErrandStatus,
        apply: impl FnOnce(&mut Errand),
    ) -> Result<Transition> {
        let mut errands = self.errands.write();
        let errand = errands
            .get_mut(errand_id)
            .ok_or_else(|| MarketError::ErrandNotFound(errand_id.to_string()))?;

        let from = errand.status;
        if !from.can_transition_to(&to) || only_from.is_some_and(|s| s != from) {
            return Err(MarketError::invalid_transition(from, to));
        }

        let runner_id = errand.assigned_runner_id.clone();
        errand.status = to;
        errand.is_open = false;
        apply(errand);

        info!(errand_id = %errand_id, from = %from, to = %to, "errand status changed");

        Ok(Transition {
            change: StatusChange {
                errand_id: errand_id.clone(),
                from,
                to,
                runner_id,
            },
            errand: errand.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn book() -> ErrandBook {
        ErrandBook::new(PricingConfig::default())
    }

    fn request() -> NewErrand {
        NewErrand::new(
            UserId::new("buyer-1"),
            Coordinate::new(0.0, 0.0),
            vec![Task::new("groceries", 1000)],
        )
    }

    fn two_km_north() -> Coordinate {
        Coordinate::new((2000.0 / crate::geo::EARTH_RADIUS_M).to_degrees(), 0.0)
    }

    fn create(book: &ErrandBook, now: DateTime<Utc>) -> Errand {
        book.create(request(), now, chrono::Duration::hours(2))
            .expect("create errand")
    }

    #[test_case(ErrandStatus::Pending, ErrandStatus::InProgress, true)]
    #[test_case(ErrandStatus::Pending, ErrandStatus::Cancelled, true)]
    #[test_case(ErrandStatus::Pending, ErrandStatus::Expired, true)]
    #[test_case(ErrandStatus::InProgress, ErrandStatus::Completed, true)]
    #[test_case(ErrandStatus::InProgress, ErrandStatus::Cancelled, true)]
    #[test_case(ErrandStatus::InProgress, ErrandStatus::Expired, true)]
    #[test_case(ErrandStatus::Pending, ErrandStatus::Completed, false)]
    #[test_case(ErrandStatus::InProgress, ErrandStatus::Pending, false)]
    #[test_case(ErrandStatus::Completed, ErrandStatus::Cancelled, false)]
    #[test_case(ErrandStatus::Cancelled, ErrandStatus::Pending, false)]
    #[test_case(ErrandStatus::Expired, ErrandStatus::InProgress, false)]
    fn status_transitions(from: ErrandStatus, to: ErrandStatus, allowed: bool) {
        assert_eq!(from.can_transition_to(&to), allowed);
    }

    #[test]
    fn status_display() {
        assert_eq!(ErrandStatus::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(ErrandStatus::Expired.to_string(), "EXPIRED");
        let json = serde_json::to_string(&ErrandStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn create_rejects_empty_tasks() {
        let mut req = request();
        req.tasks.clear();
        let err = book()
            .create(req, Utc::now(), chrono::Duration::hours(2))
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidErrand(_)));
    }

    #[test]
    fn create_rejects_blank_description() {
        let mut req = request();
        req.tasks.push(Task::new("  ", 10));
        let err = book()
            .create(req, Utc::now(), chrono::Duration::hours(2))
            .unwrap_err();
        assert_eq!(err, MarketError::InvalidErrand("task 2 has no description".into()));
    }

    #[test]
    fn create_sets_defaults() {
        let now = Utc::now();
        let errand = create(&book(), now);
        assert_eq!(errand.status, ErrandStatus::Pending);
        assert!(errand.is_open);
        assert_eq!(errand.expires_at, Some(now + chrono::Duration::hours(2)));
        assert_eq!(errand.quoted_total_price, 0);
        assert!(errand.assigned_runner_id.is_none());
    }

    #[test]
    fn create_rejects_unrepresentable_deadline() {
        let book = book();
        let err = book
            .create(request(), Utc::now(), chrono::TimeDelta::MAX)
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidErrand(_)));
        assert!(book.is_empty());
    }

    #[test]
    fn accept_prices_and_assigns() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);
        let runner = UserId::new("runner-1");

        let t = book
            .accept(&errand.id, &runner, Some(two_km_north()), now)
            .expect("accept");

        assert_eq!(t.change.from, ErrandStatus::Pending);
        assert_eq!(t.change.to, ErrandStatus::InProgress);
        assert_eq!(t.change.runner_id, Some(runner.clone()));
        assert_eq!(t.errand.quoted_distance_fee, 500);
        assert_eq!(t.errand.quoted_service_fee, 200);
        assert_eq!(t.errand.quoted_total_price, 1700);
        assert!(!t.errand.is_open);
        assert_eq!(t.errand.assigned_runner_id, Some(runner));
        assert_eq!(t.errand.accepted_at, Some(now));
    }

    #[test]
    fn accept_twice_fails_without_mutation() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);
        book.accept(&errand.id, &UserId::new("x"), Some(two_km_north()), now)
            .expect("first accept");

        let err = book
            .accept(&errand.id, &UserId::new("y"), None, now)
            .unwrap_err();
        assert_eq!(err, MarketError::invalid_transition("IN_PROGRESS", "IN_PROGRESS"));

        let stored = book.get(&errand.id).expect("get");
        assert_eq!(stored.assigned_runner_id, Some(UserId::new("x")));
        assert_eq!(stored.quoted_total_price, 1700);
    }

    #[test]
    fn accept_past_deadline_is_expired() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);
        let err = book
            .accept(&errand.id, &UserId::new("x"), None, now + chrono::Duration::hours(3))
            .unwrap_err();
        assert!(matches!(err, MarketError::ErrandExpired(_)));
        assert_eq!(book.get(&errand.id).expect("get").status, ErrandStatus::Pending);
    }

    #[test]
    fn complete_requires_in_progress() {
        let book = book();
        let errand = create(&book, Utc::now());
        let err = book.complete(&errand.id).unwrap_err();
        assert!(matches!(err, MarketError::InvalidTransition { .. }));
    }

    #[test]
    fn complete_keeps_runner_and_price() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);
        book.accept(&errand.id, &UserId::new("r"), Some(two_km_north()), now)
            .expect("accept");
        let t = book.complete(&errand.id).expect("complete");
        assert_eq!(t.errand.status, ErrandStatus::Completed);
        assert_eq!(t.errand.assigned_runner_id, Some(UserId::new("r")));
        assert_eq!(t.errand.quoted_total_price, 1700);
        assert_eq!(t.change.runner_id, Some(UserId::new("r")));
    }

    #[test]
    fn cancel_from_in_progress_clears_runner() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);
        book.accept(&errand.id, &UserId::new("r"), None, now)
            .expect("accept");
        let t = book.cancel(&errand.id).expect("cancel");
        assert_eq!(t.change.from, ErrandStatus::InProgress);
        assert_eq!(t.change.runner_id, Some(UserId::new("r")));
        assert!(t.errand.assigned_runner_id.is_none());
        assert!(!t.errand.is_open);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let book = book();
        let errand = create(&book, Utc::now());
        book.cancel(&errand.id).expect("cancel");
        assert!(book.cancel(&errand.id).is_err());
        assert!(book.expire_no_runners(&errand.id).is_err());
        assert!(book.complete(&errand.id).is_err());
    }

    #[test]
    fn expire_if_due_is_lazy_and_idempotent() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);

        assert!(book.expire_if_due(&errand.id, now).expect("not due").is_none());

        let later = now + chrono::Duration::hours(2);
        let t = book
            .expire_if_due(&errand.id, later)
            .expect("due")
            .expect("transition");
        assert_eq!(t.errand.status, ErrandStatus::Expired);
        assert!(!t.errand.is_open);

        assert!(book.expire_if_due(&errand.id, later).expect("again").is_none());
    }

    #[test]
    fn expire_if_due_expires_in_progress() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);
        book.accept(&errand.id, &UserId::new("r"), None, now)
            .expect("accept");

        let before = now + chrono::Duration::minutes(30);
        assert!(book.expire_if_due(&errand.id, before).expect("ok").is_none());

        let later = now + chrono::Duration::hours(5);
        let t = book
            .expire_if_due(&errand.id, later)
            .expect("ok")
            .expect("transition");
        assert_eq!(t.change.from, ErrandStatus::InProgress);
        assert_eq!(t.change.to, ErrandStatus::Expired);
        assert_eq!(t.change.runner_id, Some(UserId::new("r")));
        assert!(!t.errand.is_open);
    }

    #[test]
    fn expire_no_runners_refuses_in_progress() {
        let book = book();
        let now = Utc::now();
        let errand = create(&book, now);
        book.accept(&errand.id, &UserId::new("r"), None, now)
            .expect("accept");
        let err = book.expire_no_runners(&errand.id).unwrap_err();
        assert!(matches!(err, MarketError::InvalidTransition { .. }));
        assert_eq!(book.get(&errand.id).expect("get").status, ErrandStatus::InProgress);
    }

    #[test]
    fn due_for_expiry_lists_non_terminal_past_deadline() {
        let book = book();
        let now = Utc::now();
        let a = create(&book, now);
        let b = create(&book, now);
        let c = create(&book, now);
        book.cancel(&b.id).expect("cancel");
        book.accept(&c.id, &UserId::new("r"), None, now)
            .expect("accept");
        assert!(book.due_for_expiry(now).is_empty());
        let mut due = book.due_for_expiry(now + chrono::Duration::hours(3));
        due.sort();
        let mut expected = vec![a.id, c.id];
        expected.sort();
        assert_eq!(due, expected);
    }

    #[test]
    fn missing_errand_not_found() {
        let err = book().complete(&ErrandId::new("nope")).unwrap_err();
        assert_eq!(err, MarketError::ErrandNotFound("nope".into()));
    }
}
