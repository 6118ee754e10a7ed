//! Line-delimited JSON commands
//!
//! `errandd run` reads one [`Command`] per line from stdin and writes one
//! reply per line to stdout:
//!
//! ```text
//! {"op":"create_errand","buyer_id":"b1","go_to":{"latitude":51.5,"longitude":-0.12},"tasks":[{"description":"milk","price":250}]}
//! {"ok":true,"result":{"errand":{...},"side_effects":[...]}}
//! ```
//!
//! Failures come back as `{"ok":false,"kind":"NotFound","error":"..."}`.

use std::sync::Arc;

use errand_market::{
    Actor, Coordinate, Decision, ErrandId, Marketplace, NewErrand, OfferId, Outcome,
    RunnerDirectory, SideEffect, UserId,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// One client request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Post an errand and start matching it.
    CreateErrand(NewErrand),
    /// Restart matching for a PENDING errand.
    StartMatching { errand_id: ErrandId },
    /// A runner answers an offer.
    Respond {
        offer_id: OfferId,
        runner_id: UserId,
        decision: Decision,
    },
    /// Mark an errand done.
    Complete { errand_id: ErrandId, actor: ActorRef },
    /// Cancel an errand.
    Cancel { errand_id: ErrandId, actor: ActorRef },
    /// Rate the other party of a completed errand.
    Rate {
        errand_id: ErrandId,
        rater_id: UserId,
        ratee_id: UserId,
        score: u8,
        #[serde(default)]
        comment: Option<String>,
    },
    /// Poll an errand.
    Status { errand_id: ErrandId },
    /// Offers a runner can still answer.
    PendingOffers { runner_id: UserId },
    /// Register a runner or move one.
    UpsertRunner {
        runner_id: UserId,
        #[serde(default)]
        location: Option<Coordinate>,
    },
    /// Take a runner out of the directory.
    RemoveRunner { runner_id: UserId },
    /// Expire stale offers and overdue errands now.
    Sweep,
}

/// Who is acting, as `{"buyer":"id"}` or `{"runner":"id"}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRef {
    Buyer(UserId),
    Runner(UserId),
}

impl From<ActorRef> for Actor {
    fn from(actor: ActorRef) -> Self {
        match actor {
            ActorRef::Buyer(id) => Self::Buyer(id),
            ActorRef::Runner(id) => Self::Runner(id),
        }
    }
}

/// Executes commands against one marketplace.
pub struct Session {
    market: Arc<Marketplace>,
    directory: Arc<RunnerDirectory>,
}

impl Session {
    pub fn new(market: Arc<Marketplace>, directory: Arc<RunnerDirectory>) -> Self {
        Self { market, directory }
    }

    /// Parses and runs one input line. Blank lines produce no reply.
    pub fn handle_line(&self, line: &str) -> Option<Value> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let reply = match serde_json::from_str::<Command>(line) {
            Ok(command) => {
                debug!(?command, "handling command");
                match self.execute(command) {
                    Ok(result) => json!({ "ok": true, "result": result }),
                    Err(e) => {
                        warn!(error = %e, "command failed");
                        json!({ "ok": false, "kind": format!("{:?}", e.kind()), "error": e.to_string() })
                    }
                }
            }
            Err(e) => json!({ "ok": false, "kind": "Parse", "error": e.to_string() }),
        };
        Some(reply)
    }

    /// Runs one command.
    ///
    /// # Errors
    ///
    /// Returns the marketplace error of the underlying operation.
    pub fn execute(&self, command: Command) -> errand_market::Result<Value> {
        match command {
            Command::CreateErrand(request) => {
                let outcome = self.market.create_errand(request)?;
                self.spawn_matching(outcome.primary.id.clone());
                Ok(render(&outcome, |errand| json!({ "errand": errand })))
            }
            Command::StartMatching { errand_id } => {
                self.market.errands().get(&errand_id)?;
                self.spawn_matching(errand_id.clone());
                Ok(json!({ "errand_id": errand_id }))
            }
            Command::Respond {
                offer_id,
                runner_id,
                decision,
            } => {
                let outcome = self.market.respond_to_offer(&offer_id, &runner_id, decision)?;
                Ok(render(&outcome, |reply| {
                    json!({ "offer": reply.offer, "errand": reply.errand })
                }))
            }
            Command::Complete { errand_id, actor } => {
                let outcome = self.market.complete_errand(&errand_id, &actor.into())?;
                Ok(render(&outcome, |errand| json!({ "errand": errand })))
            }
            Command::Cancel { errand_id, actor } => {
                let outcome = self.market.cancel_errand(&errand_id, &actor.into())?;
                Ok(render(&outcome, |errand| json!({ "errand": errand })))
            }
            Command::Rate {
                errand_id,
                rater_id,
                ratee_id,
                score,
                comment,
            } => {
                let outcome = self
                    .market
                    .rate(&errand_id, &rater_id, &ratee_id, score, comment)?;
                Ok(render(&outcome, |rating| json!({ "rating": rating })))
            }
            Command::Status { errand_id } => {
                let view = self.market.get_errand_status(&errand_id)?;
                Ok(json!(view))
            }
            Command::PendingOffers { runner_id } => {
                Ok(json!({ "offers": self.market.pending_offers(&runner_id) }))
            }
            Command::UpsertRunner {
                runner_id,
                location,
            } => {
                if location.is_some_and(|l| !l.is_valid()) {
                    return Err(errand_market::MarketError::InvalidErrand(format!(
                        "runner {runner_id} has an invalid location"
                    )));
                }
                self.directory.upsert(runner_id.clone(), location);
                Ok(json!({ "runner_id": runner_id, "runners": self.directory.len() }))
            }
            Command::RemoveRunner { runner_id } => {
                let removed = self.directory.remove(&runner_id);
                Ok(json!({ "runner_id": runner_id, "removed": removed }))
            }
            Command::Sweep => {
                let outcome = self.market.sweep();
                Ok(render(&outcome, |report| {
                    json!({
                        "offers_expired": report.offers_expired,
                        "errands_expired": report.errands_expired,
                    })
                }))
            }
        }
    }

    fn spawn_matching(&self, errand_id: ErrandId) {
        let handle = self.market.start_matching(errand_id.clone());
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                warn!(errand_id = %errand_id, error = %e, "matching task failed");
            }
        });
    }
}

fn render<T>(outcome: &Outcome<T>, primary: impl FnOnce(&T) -> Value) -> Value {
    let mut value = primary(&outcome.primary);
    value["side_effects"] = outcome
        .side_effects
        .iter()
        .map(describe)
        .collect::<Vec<_>>()
        .into();
    value
}

fn describe(effect: &SideEffect) -> Value {
    json!({ "failure": effect.is_failure(), "detail": format!("{effect:?}") })
}
