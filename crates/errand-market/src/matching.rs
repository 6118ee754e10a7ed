//! Matching orchestration.
//!
//! Drives one errand from PENDING to a runner (or to expiry):
//!
//! 1. Look up eligible runners, retrying transient lookup failures
//! 2. Rank them by distance and trust
//! 3. Issue offers per [`MatchStrategy`]
//! 4. Wait for answers, offer deadlines or the errand deadline
//!
//! Waiting is event driven: the marketplace wakes the errand's [`Notify`]
//! on every answer, cancellation and sweep, and a timer covers the nearest
//! deadline. The acceptance itself happens in
//! [`Marketplace::respond_to_offer`]; the matcher only observes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::MatchStrategy;
use crate::errand::{Errand, ErrandStatus};
use crate::market::Marketplace;
use crate::offer::{Offer, OfferStatus};
use crate::outcome::SideEffect;
use crate::ranking::{self, RunnerCandidate};
use crate::types::{ErrandId, UserId};

/// How a matching run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// A runner accepted.
    Matched,
    /// No runner accepted; the errand expired.
    Exhausted,
    /// The errand was cancelled or closed elsewhere.
    Aborted,
    /// The errand was not PENDING and open at start.
    Skipped,
    /// Another matching task already owns the errand.
    AlreadyMatching,
}

impl std::fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Aborted => write!(f, "aborted"),
            Self::Skipped => write!(f, "skipped"),
            Self::AlreadyMatching => write!(f, "already_matching"),
        }
    }
}

/// Summary of one matching run.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchReport {
    /// The errand matched.
    pub errand_id: ErrandId,
    /// How it ended.
    pub phase: MatchPhase,
    /// The winning runner, when matched.
    pub runner_id: Option<UserId>,
    /// Offers issued.
    pub offers_sent: usize,
    /// Side effects caused along the way.
    pub side_effects: Vec<SideEffect>,
}

/// Matching phase implied by an errand that left PENDING.
const fn settled_phase(status: ErrandStatus) -> Option<MatchPhase> {
    match status {
        ErrandStatus::Pending => None,
        ErrandStatus::InProgress | ErrandStatus::Completed => Some(MatchPhase::Matched),
        ErrandStatus::Expired => Some(MatchPhase::Exhausted),
        ErrandStatus::Cancelled => Some(MatchPhase::Aborted),
    }
}

pub(crate) async fn run(market: &Marketplace, errand_id: &ErrandId) -> MatchReport {
    let Some(signal) = market.signals().register(errand_id) else {
        warn!(errand_id = %errand_id, "matching already running for errand");
        return MatchReport {
            errand_id: errand_id.clone(),
            phase: MatchPhase::AlreadyMatching,
            runner_id: None,
            offers_sent: 0,
            side_effects: Vec::new(),
        };
    };

    let mut matcher = Matcher {
        market,
        errand_id,
        signal,
        offers_sent: 0,
        side_effects: Vec::new(),
    };

    let phase = matcher.drive().await;
    market.signals().remove(errand_id);

    let runner_id = if phase == MatchPhase::Matched {
        market
            .errands()
            .get(errand_id)
            .ok()
            .and_then(|e| e.assigned_runner_id)
    } else {
        None
    };

    info!(
        errand_id = %errand_id,
        phase = %phase,
        runner_id = ?runner_id,
        offers_sent = matcher.offers_sent,
        "matching finished"
    );

    MatchReport {
        errand_id: errand_id.clone(),
        phase,
        runner_id,
        offers_sent: matcher.offers_sent,
        side_effects: matcher.side_effects,
    }
}

struct Matcher<'a> {
    market: &'a Marketplace,
    errand_id: &'a ErrandId,
    signal: Arc<Notify>,
    offers_sent: usize,
    side_effects: Vec<SideEffect>,
}

impl Matcher<'_> {
    async fn drive(&mut self) -> MatchPhase {
        let errand = match self.market.errands().get(self.errand_id) {
            Ok(errand) => errand,
            Err(e) => {
                warn!(errand_id = %self.errand_id, error = %e, "cannot match unknown errand");
                return MatchPhase::Skipped;
            }
        };
        if !errand.is_matchable() {
            debug!(errand_id = %self.errand_id, status = %errand.status, "errand not matchable");
            return MatchPhase::Skipped;
        }
        if let Some(phase) = self.settle() {
            return phase;
        }

        let strategy = self.market.config().strategy;
        info!(errand_id = %self.errand_id, %strategy, "matching started");

        let Some(candidates) = self.fetch_candidates(&errand).await else {
            return self.give_up();
        };
        let ranked = ranking::rank(&errand, candidates);
        if ranked.is_empty() {
            info!(errand_id = %self.errand_id, "no eligible runners");
            return self.give_up();
        }

        match strategy {
            MatchStrategy::Broadcast => self.broadcast(&ranked).await,
            MatchStrategy::Sequential => self.sequential(&ranked).await,
        }
    }

    async fn broadcast(&mut self, ranked: &[RunnerCandidate]) -> MatchPhase {
        let limit = self.market.config().broadcast_limit;
        for (idx, candidate) in ranked.iter().take(limit).enumerate() {
            self.offer(candidate, idx).await;
        }

        loop {
            if let Some(phase) = self.settle() {
                return phase;
            }
            let now = self.market.now();
            let next_deadline = self
                .market
                .offers()
                .offers_for_errand(self.errand_id)
                .iter()
                .filter(|o| o.is_actionable(now))
                .map(|o| o.expires_at)
                .min();
            let Some(deadline) = next_deadline else {
                return self.give_up();
            };
            self.wait_until(deadline).await;
        }
    }

    async fn sequential(&mut self, ranked: &[RunnerCandidate]) -> MatchPhase {
        for (idx, candidate) in ranked.iter().enumerate() {
            if let Some(phase) = self.settle() {
                return phase;
            }
            let Some(offer) = self.offer(candidate, idx).await else {
                continue;
            };

            loop {
                if let Some(phase) = self.settle() {
                    return phase;
                }
                let now = self.market.now();
                let Ok(current) = self.market.offers().get(&offer.id) else {
                    break;
                };
                if current.is_actionable(now) {
                    self.wait_until(current.expires_at).await;
                    continue;
                }
                if current.status == OfferStatus::Pending {
                    self.market.offers().expire_stale(now);
                }
                debug!(
                    errand_id = %self.errand_id,
                    runner_id = %current.runner_id,
                    status = %current.status,
                    "advancing to next runner"
                );
                break;
            }
        }
        self.give_up()
    }

    /// Returns the final phase if the errand has left PENDING, expiring it
    /// first when its deadline has passed.
    fn settle(&mut self) -> Option<MatchPhase> {
        match self.market.expire_if_due(self.errand_id) {
            Ok(Some(outcome)) => {
                self.side_effects.extend(outcome.side_effects);
                return Some(MatchPhase::Exhausted);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(errand_id = %self.errand_id, error = %e, "errand vanished during matching");
                return Some(MatchPhase::Aborted);
            }
        }
        match self.market.errands().get(self.errand_id) {
            Ok(errand) => settled_phase(errand.status),
            Err(_) => Some(MatchPhase::Aborted),
        }
    }

    fn give_up(&mut self) -> MatchPhase {
        match self.market.expire_unmatched(self.errand_id) {
            Ok(outcome) => {
                self.side_effects.extend(outcome.side_effects);
                MatchPhase::Exhausted
            }
            // Accepted or cancelled concurrently.
            Err(_) => self.settle().unwrap_or(MatchPhase::Aborted),
        }
    }

    async fn fetch_candidates(&self, errand: &Errand) -> Option<Vec<RunnerCandidate>> {
        let policy = self.market.config().retry;
        for attempt in 1..=policy.max_attempts {
            match self.market.candidates().nearby_runners(errand) {
                Ok(candidates) => return Some(candidates),
                Err(e) => {
                    warn!(
                        errand_id = %errand.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "candidate lookup failed"
                    );
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.backoff()).await;
                    }
                }
            }
        }
        None
    }

    async fn offer(&mut self, candidate: &RunnerCandidate, idx: usize) -> Option<Offer> {
        let position = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        let offer = match self
            .market
            .issue_offer(self.errand_id, candidate, position)
        {
            Ok(offer) => offer,
            Err(e) => {
                debug!(
                    errand_id = %self.errand_id,
                    runner_id = %candidate.runner_id,
                    error = %e,
                    "offer not sent"
                );
                return None;
            }
        };
        self.offers_sent += 1;
        self.notify(&offer).await;
        Some(offer)
    }

    async fn notify(&mut self, offer: &Offer) {
        let policy = self.market.config().retry;
        let mut last_error = None;
        for attempt in 1..=policy.max_attempts {
            match self.market.notifier().notify_offer(&offer.runner_id, offer) {
                Ok(()) => return,
                Err(e) => {
                    debug!(offer_id = %offer.id, attempt, error = %e, "notify failed");
                    last_error = Some(e);
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.backoff()).await;
                    }
                }
            }
        }
        if let Some(error) = last_error {
            warn!(offer_id = %offer.id, runner_id = %offer.runner_id, error = %error, "runner not notified");
            self.side_effects.push(SideEffect::NotifyFailed {
                runner_id: offer.runner_id.clone(),
                offer_id: offer.id.clone(),
                error,
            });
        }
    }

    /// Sleeps until `deadline` (capped by the errand deadline) or a wake-up.
    async fn wait_until(&self, deadline: DateTime<Utc>) {
        let errand_deadline = self
            .market
            .errands()
            .get(self.errand_id)
            .ok()
            .and_then(|e| e.expires_at);
        let deadline = errand_deadline.map_or(deadline, |d| d.min(deadline));
        let wait = (deadline - self.market.now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            () = self.signal.notified() => {}
            () = tokio::time::sleep(wait) => {
                self.market.offers().expire_stale(self.market.now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MarketConfig, RetryPolicy};
    use crate::directory::RunnerDirectory;
    use crate::errand::NewErrand;
    use crate::market::Actor;
    use crate::offer::Decision;
    use crate::ports::{NoOpGateway, RecordingNotifier};
    use crate::trust::TrustLedger;
    use crate::types::{Coordinate, Task};

    struct Fixture {
        market: Arc<Marketplace>,
        directory: Arc<RunnerDirectory>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(config: MarketConfig) -> Fixture {
        let trust = Arc::new(TrustLedger::new());
        let directory = Arc::new(RunnerDirectory::new(Arc::clone(&trust)));
        let notifier = Arc::new(RecordingNotifier::new());
        let market = Marketplace::new(config, directory.clone(), Arc::new(NoOpGateway))
            .with_notifier(notifier.clone())
            .with_trust(trust);
        Fixture {
            market: Arc::new(market),
            directory,
            notifier,
        }
    }

    fn config(strategy: MatchStrategy, offer_ttl_ms: u64) -> MarketConfig {
        MarketConfig::new()
            .with_strategy(strategy)
            .with_offer_ttl(Duration::from_millis(offer_ttl_ms))
            .with_retry(RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
            })
    }

    fn post(market: &Marketplace) -> Errand {
        market
            .create_errand(NewErrand::new(
                UserId::new("buyer"),
                Coordinate::new(0.0, 0.0),
                vec![Task::new("groceries", 1000)],
            ))
            .unwrap()
            .primary
    }

    async fn wait_for_offer(market: &Marketplace, runner: &str) -> Offer {
        let runner = UserId::new(runner);
        for _ in 0..400 {
            if let Some(offer) = market.pending_offers(&runner).into_iter().next() {
                return offer;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no offer for {runner}");
    }

    #[tokio::test]
    async fn no_runners_expires_errand() {
        let f = fixture(config(MatchStrategy::Broadcast, 1_000));
        let errand = post(&f.market);

        let report = f.market.run_matching(&errand.id).await;

        assert_eq!(report.phase, MatchPhase::Exhausted);
        assert_eq!(report.offers_sent, 0);
        let errand = f.market.errands().get(&errand.id).unwrap();
        assert_eq!(errand.status, ErrandStatus::Expired);
        assert!(!errand.is_open);
    }

    #[tokio::test]
    async fn not_pending_is_skipped() {
        let f = fixture(config(MatchStrategy::Broadcast, 1_000));
        let errand = post(&f.market);
        f.market
            .cancel_errand(&errand.id, &Actor::Buyer(UserId::new("buyer")))
            .unwrap();

        let report = f.market.run_matching(&errand.id).await;
        assert_eq!(report.phase, MatchPhase::Skipped);
    }

    #[tokio::test]
    async fn broadcast_first_accept_wins() {
        let f = fixture(config(MatchStrategy::Broadcast, 5_000));
        f.directory
            .upsert(UserId::new("near"), Some(Coordinate::new(0.01, 0.0)));
        f.directory
            .upsert(UserId::new("far"), Some(Coordinate::new(0.05, 0.0)));
        let errand = post(&f.market);

        let handle = f.market.start_matching(errand.id.clone());
        let offer = wait_for_offer(&f.market, "far").await;
        f.market
            .respond_to_offer(&offer.id, &offer.runner_id, Decision::Accept)
            .unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.phase, MatchPhase::Matched);
        assert_eq!(report.runner_id, Some(UserId::new("far")));
        assert_eq!(report.offers_sent, 2);
        assert_eq!(f.notifier.delivered().len(), 2);
        assert!(f.market.pending_offers(&UserId::new("near")).is_empty());
    }

    #[tokio::test]
    async fn second_matcher_for_same_errand_backs_off() {
        let f = fixture(config(MatchStrategy::Broadcast, 5_000));
        f.directory
            .upsert(UserId::new("r1"), Some(Coordinate::new(0.01, 0.0)));
        let errand = post(&f.market);

        let first = f.market.start_matching(errand.id.clone());
        wait_for_offer(&f.market, "r1").await;

        let second = f.market.run_matching(&errand.id).await;
        assert_eq!(second.phase, MatchPhase::AlreadyMatching);
        assert_eq!(second.offers_sent, 0);
        assert_eq!(f.notifier.delivered().len(), 1);
        assert_eq!(f.market.offers().offers_for_errand(&errand.id).len(), 1);

        f.market
            .cancel_errand(&errand.id, &Actor::Buyer(UserId::new("buyer")))
            .unwrap();
        let report = first.await.unwrap();
        assert_eq!(report.phase, MatchPhase::Aborted);

        // The claim is released once the first run ends.
        let again = f.market.run_matching(&errand.id).await;
        assert_eq!(again.phase, MatchPhase::Skipped);
    }

    #[tokio::test]
    async fn broadcast_all_rejected_expires() {
        let f = fixture(config(MatchStrategy::Broadcast, 5_000));
        f.directory
            .upsert(UserId::new("r1"), Some(Coordinate::new(0.01, 0.0)));
        let errand = post(&f.market);

        let handle = f.market.start_matching(errand.id.clone());
        let offer = wait_for_offer(&f.market, "r1").await;
        f.market
            .respond_to_offer(&offer.id, &offer.runner_id, Decision::Reject)
            .unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.phase, MatchPhase::Exhausted);
        assert_eq!(
            f.market.errands().get(&errand.id).unwrap().status,
            ErrandStatus::Expired
        );
    }

    #[tokio::test]
    async fn broadcast_respects_limit() {
        let f = fixture(config(MatchStrategy::Broadcast, 30).with_broadcast_limit(2));
        for i in 0..5 {
            f.directory.upsert(
                UserId::new(format!("r{i}")),
                Some(Coordinate::new(0.01 * f64::from(i + 1), 0.0)),
            );
        }
        let errand = post(&f.market);

        let report = f.market.run_matching(&errand.id).await;
        assert_eq!(report.phase, MatchPhase::Exhausted);
        assert_eq!(report.offers_sent, 2);
        let runners: Vec<UserId> = f
            .market
            .offers()
            .offers_for_errand(&errand.id)
            .into_iter()
            .map(|o| o.runner_id)
            .collect();
        assert_eq!(runners, vec![UserId::new("r0"), UserId::new("r1")]);
    }

    #[tokio::test]
    async fn sequential_advances_on_reject() {
        let f = fixture(config(MatchStrategy::Sequential, 5_000));
        f.directory
            .upsert(UserId::new("first"), Some(Coordinate::new(0.01, 0.0)));
        f.directory
            .upsert(UserId::new("second"), Some(Coordinate::new(0.02, 0.0)));
        let errand = post(&f.market);

        let handle = f.market.start_matching(errand.id.clone());

        let offer = wait_for_offer(&f.market, "first").await;
        assert_eq!(offer.position, 1);
        assert!(f.market.pending_offers(&UserId::new("second")).is_empty());
        f.market
            .respond_to_offer(&offer.id, &offer.runner_id, Decision::Reject)
            .unwrap();

        let offer = wait_for_offer(&f.market, "second").await;
        assert_eq!(offer.position, 2);
        f.market
            .respond_to_offer(&offer.id, &offer.runner_id, Decision::Accept)
            .unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.phase, MatchPhase::Matched);
        assert_eq!(report.runner_id, Some(UserId::new("second")));
    }

    #[tokio::test]
    async fn sequential_advances_on_timeout() {
        let f = fixture(config(MatchStrategy::Sequential, 40));
        f.directory
            .upsert(UserId::new("slow"), Some(Coordinate::new(0.01, 0.0)));
        f.directory
            .upsert(UserId::new("quick"), Some(Coordinate::new(0.02, 0.0)));
        let errand = post(&f.market);

        let handle = f.market.start_matching(errand.id.clone());
        let offer = wait_for_offer(&f.market, "quick").await;
        f.market
            .respond_to_offer(&offer.id, &offer.runner_id, Decision::Accept)
            .unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.phase, MatchPhase::Matched);
        let slow = f
            .market
            .offers()
            .offers_for_errand(&errand.id)
            .into_iter()
            .find(|o| o.runner_id == UserId::new("slow"))
            .unwrap();
        assert_eq!(slow.status, OfferStatus::Expired);
    }

    #[tokio::test]
    async fn lookup_failures_are_retried() {
        let f = fixture(config(MatchStrategy::Broadcast, 20));
        f.directory
            .upsert(UserId::new("r1"), Some(Coordinate::new(0.01, 0.0)));
        f.directory.fail_next(2);
        let errand = post(&f.market);

        let report = f.market.run_matching(&errand.id).await;
        assert_eq!(report.offers_sent, 1);
        assert_eq!(report.phase, MatchPhase::Exhausted);
    }

    #[tokio::test]
    async fn persistent_lookup_failure_expires() {
        let f = fixture(config(MatchStrategy::Broadcast, 20));
        f.directory
            .upsert(UserId::new("r1"), Some(Coordinate::new(0.01, 0.0)));
        f.directory.fail_next(3);
        let errand = post(&f.market);

        let report = f.market.run_matching(&errand.id).await;
        assert_eq!(report.offers_sent, 0);
        assert_eq!(report.phase, MatchPhase::Exhausted);
    }

    #[tokio::test]
    async fn notify_failure_does_not_fail_offer() {
        let f = fixture(config(MatchStrategy::Broadcast, 20));
        f.notifier.set_failing(true);
        f.directory
            .upsert(UserId::new("r1"), Some(Coordinate::new(0.01, 0.0)));
        let errand = post(&f.market);

        let report = f.market.run_matching(&errand.id).await;
        assert_eq!(report.offers_sent, 1);
        assert!(report
            .side_effects
            .iter()
            .any(|e| matches!(e, SideEffect::NotifyFailed { .. })));
    }

    #[tokio::test]
    async fn cancel_during_matching_aborts() {
        let f = fixture(config(MatchStrategy::Broadcast, 5_000));
        f.directory
            .upsert(UserId::new("r1"), Some(Coordinate::new(0.01, 0.0)));
        let errand = post(&f.market);

        let handle = f.market.start_matching(errand.id.clone());
        let offer = wait_for_offer(&f.market, "r1").await;
        f.market
            .cancel_errand(&errand.id, &Actor::Buyer(UserId::new("buyer")))
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("matcher woke on cancel")
            .unwrap();
        assert_eq!(report.phase, MatchPhase::Aborted);
        assert_eq!(
            f.market.offers().get(&offer.id).unwrap().status,
            OfferStatus::Expired
        );
    }

    #[test]
    fn phase_display() {
        assert_eq!(MatchPhase::Exhausted.to_string(), "exhausted");
        assert_eq!(settled_phase(ErrandStatus::Cancelled), Some(MatchPhase::Aborted));
        assert_eq!(settled_phase(ErrandStatus::Pending), None);
    }
}
