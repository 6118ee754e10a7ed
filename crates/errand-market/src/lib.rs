//! Errand matching, offer lifecycle and escrow engine.
//!
//! `errand-market` is the core of an errand marketplace: buyers post errands
//! made of priced tasks, nearby trusted runners receive time-bounded offers,
//! exactly one runner wins, and the buyer's funds sit in escrow until the
//! errand completes (release) or is cancelled or expires (refund).
//!
//! # Features
//!
//! - **Ranking**: great-circle distance first, trust score second
//! - **Offers**: per-runner TTLs, atomic sibling expiry on acceptance
//! - **Matching**: broadcast or sequential strategies on tokio, bounded by
//!   the errand deadline
//! - **Pricing**: service and distance fees fixed once at acceptance
//! - **Escrow**: append-only custody driven by errand status changes
//! - **Trust**: post-errand ratings recalculate trust scores
//!
//! # Errand lifecycle
//!
//! | From | Event | To | Escrow |
//! |------|-------|----|--------|
//! | `PENDING` | runner accepts | `IN_PROGRESS` | created, buyer charged |
//! | `IN_PROGRESS` | completed | `COMPLETED` | released to runner |
//! | `PENDING`/`IN_PROGRESS` | buyer cancels | `CANCELLED` | refunded if held |
//! | `PENDING` | no runner / deadline | `EXPIRED` | none held |
//! | `IN_PROGRESS` | deadline | `EXPIRED` | refunded |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use errand_market::{
//!     Coordinate, ErrandStatus, MarketConfig, Marketplace, NewErrand, NoOpGateway,
//!     RunnerDirectory, Task, TrustLedger, UserId,
//! };
//!
//! let trust = Arc::new(TrustLedger::new());
//! let directory = Arc::new(RunnerDirectory::new(Arc::clone(&trust)));
//! directory.upsert(UserId::new("runner-1"), Some(Coordinate::new(51.501, -0.141)));
//!
//! let market = Marketplace::new(MarketConfig::default(), directory, Arc::new(NoOpGateway))
//!     .with_trust(trust);
//!
//! let errand = market
//!     .create_errand(NewErrand::new(
//!         UserId::new("buyer-1"),
//!         Coordinate::new(51.5014, -0.1419),
//!         vec![Task::new("collect parcel", 1500)],
//!     ))
//!     .unwrap()
//!     .primary;
//!
//! let view = market.get_errand_status(&errand.id).unwrap();
//! assert_eq!(view.errand.status, ErrandStatus::Pending);
//! assert_eq!(view.nearby_runners.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod directory;
pub mod errand;
pub mod error;
pub mod escrow;
pub mod geo;
pub mod market;
pub mod matching;
pub mod offer;
pub mod outcome;
pub mod ports;
pub mod pricing;
pub mod ranking;
pub mod sweeper;
pub mod trust;
pub mod types;

pub use config::{MarketConfig, MatchStrategy, PricingConfig, RetryPolicy};
pub use directory::RunnerDirectory;
pub use errand::{Errand, ErrandBook, ErrandStatus, NewErrand, StatusChange, Transition};
pub use error::{ErrorKind, MarketError, Result};
pub use escrow::{Escrow, EscrowLedger, EscrowStatus};
pub use geo::{distance_km, distance_m};
pub use market::{Actor, ErrandLocks, ErrandStatusView, Marketplace, OfferReply, SweepReport};
pub use matching::{MatchPhase, MatchReport};
pub use offer::{Decision, Offer, OfferBook, OfferStatus, Response};
pub use outcome::{Outcome, SideEffect};
pub use ports::{
    CandidateSource, Clock, GatewayCall, GatewayRef, LoggingNotifier, ManualClock, NoOpGateway,
    Notifier, PaymentGateway, RecordingGateway, RecordingNotifier, SystemClock,
};
pub use pricing::Quote;
pub use ranking::{RunnerCandidate, rank};
pub use sweeper::{SweeperHandle, start_sweeper};
pub use trust::{DEFAULT_TRUST_SCORE, Rating, TrustEvent, TrustLedger};
pub use types::{Coordinate, ErrandId, EscrowId, OfferId, Task, UserId};
