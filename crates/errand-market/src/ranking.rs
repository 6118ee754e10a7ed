//! Runner ranking for errand matching.
//!
//! Orders eligible runners so the closest, most trusted runner is offered
//! first. Eligibility (runner capability, saved location) is decided by the
//! [`CandidateSource`](crate::ports::CandidateSource); ranking only orders.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::errand::Errand;
use crate::geo::distance_m;
use crate::types::{Coordinate, UserId};

/// Highest trust score a user can hold.
pub const MAX_TRUST_SCORE: u8 = 100;

/// A runner snapshot used for ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerCandidate {
    /// The runner.
    pub runner_id: UserId,
    /// Last known location, if any.
    pub location: Option<Coordinate>,
    /// Trust score (0-100).
    pub trust_score: u8,
    /// Distance to the errand pickup point in meters. Filled in by [`rank`].
    pub distance_m: f64,
}

impl RunnerCandidate {
    /// Creates a candidate. Distance is unknown until ranked.
    #[must_use]
    pub fn new(runner_id: UserId, location: Option<Coordinate>, trust_score: u8) -> Self {
        Self {
            runner_id,
            location,
            trust_score: trust_score.min(MAX_TRUST_SCORE),
            distance_m: f64::INFINITY,
        }
    }

    /// Ranking order: distance ascending, trust descending, runner id ascending.
    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.distance_m
            .total_cmp(&other.distance_m)
            .then_with(|| other.trust_score.cmp(&self.trust_score))
            .then_with(|| self.runner_id.cmp(&other.runner_id))
    }
}

/// Ranks candidates for an errand.
///
/// Distances are recomputed against `errand.go_to`; candidates without a
/// usable location get `+Inf` and sort last. The result is deterministic for
/// a given input set regardless of input order.
#[must_use]
pub fn rank(errand: &Errand, candidates: Vec<RunnerCandidate>) -> Vec<RunnerCandidate> {
    let mut ranked: Vec<RunnerCandidate> = candidates
        .into_iter()
        .map(|mut c| {
            c.distance_m = distance_m(c.location, Some(errand.go_to));
            c
        })
        .collect();

    ranked.sort_by(RunnerCandidate::rank_cmp);

    tracing::debug!(
        errand_id = %errand.id,
        candidates = ranked.len(),
        "ranked runner candidates"
    );

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errand::NewErrand;
    use crate::types::Task;
    use chrono::Utc;

    fn errand_at(lat: f64, lon: f64) -> Errand {
        let new = NewErrand::new(
            UserId::new("buyer"),
            Coordinate::new(lat, lon),
            vec![Task::new("pickup", 1000)],
        );
        Errand::from_request(new, Utc::now(), chrono::Duration::hours(2)).unwrap()
    }

    fn candidate(id: &str, lat: f64, trust: u8) -> RunnerCandidate {
        RunnerCandidate::new(UserId::new(id), Some(Coordinate::new(lat, 0.0)), trust)
    }

    #[test]
    fn empty_input_empty_output() {
        let errand = errand_at(0.0, 0.0);
        assert!(rank(&errand, Vec::new()).is_empty());
    }

    #[test]
    fn sorts_by_distance_first() {
        let errand = errand_at(0.0, 0.0);
        let ranked = rank(
            &errand,
            vec![
                candidate("far", 0.05, 100),
                candidate("near", 0.01, 10),
                candidate("mid", 0.02, 50),
            ],
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.runner_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(ranked[0].distance_m < ranked[1].distance_m);
    }

    #[test]
    fn ties_broken_by_trust_then_id() {
        let errand = errand_at(0.0, 0.0);
        let ranked = rank(
            &errand,
            vec![
                candidate("b", 0.01, 60),
                candidate("c", 0.01, 90),
                candidate("a", 0.01, 60),
            ],
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.runner_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn missing_location_sorts_last() {
        let errand = errand_at(0.0, 0.0);
        let ranked = rank(
            &errand,
            vec![
                RunnerCandidate::new(UserId::new("ghost"), None, 100),
                candidate("real", 0.5, 0),
            ],
        );
        assert_eq!(ranked[0].runner_id.as_str(), "real");
        assert_eq!(ranked[1].runner_id.as_str(), "ghost");
        assert!(ranked[1].distance_m.is_infinite());
    }

    #[test]
    fn trust_score_is_clamped() {
        let c = RunnerCandidate::new(UserId::new("r"), None, 250);
        assert_eq!(c.trust_score, MAX_TRUST_SCORE);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_candidates() -> impl Strategy<Value = Vec<RunnerCandidate>> {
            prop::collection::vec(
                (
                    0u32..50,
                    prop::option::of((-1.0f64..1.0, -1.0f64..1.0)),
                    0u8..=100,
                ),
                0..20,
            )
            .prop_map(|raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, (tag, loc, trust))| {
                        RunnerCandidate::new(
                            UserId::new(format!("runner-{tag}-{i}")),
                            loc.map(|(lat, lon)| Coordinate::new(lat, lon)),
                            trust,
                        )
                    })
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn output_is_sorted(candidates in arb_candidates()) {
                let errand = errand_at(0.0, 0.0);
                let ranked = rank(&errand, candidates);
                for pair in ranked.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    prop_assert!(a.distance_m <= b.distance_m || b.distance_m.is_nan());
                    if a.distance_m.total_cmp(&b.distance_m) == Ordering::Equal {
                        prop_assert!(a.trust_score >= b.trust_score);
                    }
                }
            }

            #[test]
            fn deterministic_regardless_of_input_order(candidates in arb_candidates()) {
                let errand = errand_at(0.0, 0.0);
                let mut reversed = candidates.clone();
                reversed.reverse();
                let first: Vec<UserId> = rank(&errand, candidates)
                    .into_iter().map(|c| c.runner_id).collect();
                let second: Vec<UserId> = rank(&errand, reversed)
                    .into_iter().map(|c| c.runner_id).collect();
                prop_assert_eq!(first, second);
            }
        }
    }
}
