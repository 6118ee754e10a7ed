//! Trust scores and post-errand ratings.
//!
//! Buyer and runner rate each other once a completed errand is done. A
//! user's trust score is their mean rating scaled to 0-100; users without
//! history hold [`DEFAULT_TRUST_SCORE`]. Every score change is recorded as a
//! [`TrustEvent`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errand::{Errand, ErrandStatus};
use crate::error::{MarketError, Result};
use crate::ranking::MAX_TRUST_SCORE;
use crate::types::{ErrandId, UserId};

/// Score held by a user with no rating history.
pub const DEFAULT_TRUST_SCORE: u8 = 60;

/// Lowest allowed rating.
pub const MIN_RATING: u8 = 1;

/// Highest allowed rating.
pub const MAX_RATING: u8 = 5;

/// One user's rating of another for an errand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    /// The errand rated.
    pub errand_id: ErrandId,
    /// Who rated.
    pub rater_id: UserId,
    /// Who was rated.
    pub ratee_id: UserId,
    /// Score, 1-5.
    pub score: u8,
    /// Free-form comment.
    pub comment: Option<String>,
    /// When the rating was made.
    pub created_at: DateTime<Utc>,
}

/// A recorded trust score change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEvent {
    /// Whose score changed.
    pub user_id: UserId,
    /// Change applied (new - old).
    pub delta: i16,
    /// Score after the change.
    pub score: u8,
    /// Why.
    pub reason: String,
    /// When.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    scores: HashMap<UserId, u8>,
    ratings: Vec<Rating>,
    events: Vec<TrustEvent>,
}

impl Inner {
    fn score(&self, user_id: &UserId) -> u8 {
        self.scores
            .get(user_id)
            .copied()
            .unwrap_or(DEFAULT_TRUST_SCORE)
    }

    fn set(
        &mut self,
        user_id: &UserId,
        score: u8,
        reason: String,
        now: DateTime<Utc>,
    ) -> TrustEvent {
        let old = self.score(user_id);
        let new = score.min(MAX_TRUST_SCORE);
        self.scores.insert(user_id.clone(), new);
        let event = TrustEvent {
            user_id: user_id.clone(),
            delta: i16::from(new) - i16::from(old),
            score: new,
            reason,
            created_at: now,
        };
        self.events.push(event.clone());
        event
    }
}

/// Ratings and trust scores.
#[derive(Debug, Default)]
pub struct TrustLedger {
    inner: RwLock<Inner>,
}

impl TrustLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score, or the default for unknown users.
    #[must_use]
    pub fn trust_score(&self, user_id: &UserId) -> u8 {
        self.inner.read().score(user_id)
    }

    /// Seeds a score directly (clamped to 0-100).
    pub fn set_trust_score(&self, user_id: &UserId, score: u8, now: DateTime<Utc>) -> TrustEvent {
        self.inner
            .write()
            .set(user_id, score, "seeded".to_string(), now)
    }

    /// Moves a score by `delta`, clamped to 0-100.
    pub fn adjust(
        &self,
        user_id: &UserId,
        delta: i16,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> TrustEvent {
        let mut inner = self.inner.write();
        let target = i16::from(inner.score(user_id))
            .saturating_add(delta)
            .clamp(0, i16::from(MAX_TRUST_SCORE));
        let event = inner.set(user_id, target as u8, reason.into(), now);
        info!(user_id = %user_id, delta = event.delta, score = event.score, "trust adjusted");
        event
    }

    /// Records a rating and recalculates the ratee's score.
    ///
    /// # Errors
    ///
    /// - [`MarketError::InvalidTransition`] unless the errand is COMPLETED
    /// - [`MarketError::Unauthorized`] unless rater and ratee are the
    ///   errand's buyer and runner
    /// - [`MarketError::InvalidRating`] if the score is outside 1-5
    /// - [`MarketError::RatingAlreadyExists`] on a repeat rating
    pub fn record_rating(
        &self,
        errand: &Errand,
        rater_id: &UserId,
        ratee_id: &UserId,
        score: u8,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Rating, TrustEvent)> {
        if errand.status != ErrandStatus::Completed {
            return Err(MarketError::invalid_transition(
                errand.status,
                ErrandStatus::Completed,
            ));
        }

        let Some(runner_id) = errand.assigned_runner_id.as_ref() else {
            return Err(MarketError::Unauthorized(format!(
                "errand {} has no runner",
                errand.id
            )));
        };
        let buyer_id = &errand.buyer_id;
        let participants = (rater_id == buyer_id && ratee_id == runner_id)
            || (rater_id == runner_id && ratee_id == buyer_id);
        if !participants {
            return Err(MarketError::Unauthorized(format!(
                "{rater_id} cannot rate {ratee_id} for errand {}",
                errand.id
            )));
        }

        if !(MIN_RATING..=MAX_RATING).contains(&score) {
            return Err(MarketError::InvalidRating(format!(
                "score {score} outside {MIN_RATING}-{MAX_RATING}"
            )));
        }

        let mut inner = self.inner.write();
        let duplicate = inner.ratings.iter().any(|r| {
            r.errand_id == errand.id && &r.rater_id == rater_id && &r.ratee_id == ratee_id
        });
        if duplicate {
            return Err(MarketError::RatingAlreadyExists(format!(
                "{rater_id} -> {ratee_id} for errand {}",
                errand.id
            )));
        }

        let rating = Rating {
            errand_id: errand.id.clone(),
            rater_id: rater_id.clone(),
            ratee_id: ratee_id.clone(),
            score,
            comment,
            created_at: now,
        };
        inner.ratings.push(rating.clone());

        let new_score = recalculate(
            inner
                .ratings
                .iter()
                .filter(|r| &r.ratee_id == ratee_id)
                .map(|r| r.score),
        );
        let event = inner.set(ratee_id, new_score, format!("rating on errand {}", errand.id), now);

        info!(
            errand_id = %errand.id,
            rater_id = %rater_id,
            ratee_id = %ratee_id,
            score,
            trust_score = event.score,
            "rating recorded"
        );

        Ok((rating, event))
    }

    /// Ratings received by a user.
    #[must_use]
    pub fn ratings_for(&self, user_id: &UserId) -> Vec<Rating> {
        self.inner
            .read()
            .ratings
            .iter()
            .filter(|r| &r.ratee_id == user_id)
            .cloned()
            .collect()
    }

    /// Score history of a user, oldest first.
    #[must_use]
    pub fn events_for(&self, user_id: &UserId) -> Vec<TrustEvent> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| &e.user_id == user_id)
            .cloned()
            .collect()
    }
}

/// `round(mean(scores) × 20)`, clamped to 0-100. Empty input gives the default.
fn recalculate(scores: impl Iterator<Item = u8>) -> u8 {
    let (sum, count) = scores.fold((0u32, 0u32), |(s, c), x| (s + u32::from(x), c + 1));
    if count == 0 {
        return DEFAULT_TRUST_SCORE;
    }
    // mean × 20 = sum × 20 / count, rounded half up
    let scaled = (sum * 20 * 2 + count) / (count * 2);
    scaled.min(u32::from(MAX_TRUST_SCORE)) as u8
}
