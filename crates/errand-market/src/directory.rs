//! In-memory runner directory.
//!
//! A [`CandidateSource`] over registered runners and their last known
//! location, joined with trust scores from the [`TrustLedger`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::errand::Errand;
use crate::error::{MarketError, Result};
use crate::ports::CandidateSource;
use crate::ranking::RunnerCandidate;
use crate::trust::TrustLedger;
use crate::types::{Coordinate, UserId};

/// Registered runners and where they were last seen.
#[derive(Debug)]
pub struct RunnerDirectory {
    runners: RwLock<HashMap<UserId, Option<Coordinate>>>,
    trust: Arc<TrustLedger>,
    fail_next: AtomicU32,
}

impl RunnerDirectory {
    /// Creates an empty directory reading scores from `trust`.
    #[must_use]
    pub fn new(trust: Arc<TrustLedger>) -> Self {
        Self {
            runners: RwLock::new(HashMap::new()),
            trust,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Registers a runner, or updates their location.
    pub fn upsert(&self, runner_id: UserId, location: Option<Coordinate>) {
        debug!(runner_id = %runner_id, ?location, "runner location updated");
        self.runners.write().insert(runner_id, location);
    }

    /// Removes a runner. Returns true if they were registered.
    pub fn remove(&self, runner_id: &UserId) -> bool {
        self.runners.write().remove(runner_id).is_some()
    }

    /// Number of registered runners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runners.read().len()
    }

    /// Returns true if no runners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runners.read().is_empty()
    }

    /// Makes the next `n` lookups fail (for testing retries).
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

impl CandidateSource for RunnerDirectory {
    fn nearby_runners(&self, errand: &Errand) -> Result<Vec<RunnerCandidate>> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MarketError::CandidateSource("directory unavailable".into()));
        }

        // Runners without a saved location are not eligible, nor is the buyer.
        let candidates: Vec<RunnerCandidate> = self
            .runners
            .read()
            .iter()
            .filter(|(id, _)| **id != errand.buyer_id)
            .filter_map(|(id, location)| {
                location.map(|loc| {
                    RunnerCandidate::new(id.clone(), Some(loc), self.trust.trust_score(id))
                })
            })
            .collect();

        debug!(errand_id = %errand.id, eligible = candidates.len(), "runner lookup");
        Ok(candidates)
    }
}
