//! Error types for errand-market.

use thiserror::Error;

/// Result type for marketplace operations.
pub type Result<T> = std::result::Result<T, MarketError>;

/// Coarse classification of a [`MarketError`], used by callers that map
/// failures onto user-visible responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Errand, offer or escrow missing.
    NotFound,
    /// A state machine precondition was violated.
    InvalidTransition,
    /// Duplicate escrow or rating.
    AlreadyExists,
    /// Offer or errand past its deadline.
    Expired,
    /// Actor is not permitted to perform the operation.
    Unauthorized,
    /// Payment collaborator failure. Never fatal to local state.
    GatewayFailure,
    /// Malformed input or configuration.
    Invalid,
}

/// Errors that can occur in marketplace operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketError {
    /// Errand not found.
    #[error("errand not found: {0}")]
    ErrandNotFound(String),

    /// No pending offer matches the offer id and runner.
    ///
    /// Covers already-resolved, wrong-runner and nonexistent offers alike.
    #[error("offer not found or already processed: {0}")]
    OfferNotFound(String),

    /// Escrow not found for an errand.
    #[error("escrow not found for errand: {0}")]
    EscrowNotFound(String),

    /// Invalid state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// An escrow already exists for the errand.
    #[error("escrow already exists for errand: {0}")]
    EscrowAlreadyExists(String),

    /// The offer deadline has passed.
    #[error("offer has expired: {0}")]
    OfferExpired(String),

    /// The errand is no longer accepting runners.
    #[error("errand has expired or closed: {0}")]
    ErrandExpired(String),

    /// Actor is not permitted to act on the resource.
    #[error("not permitted: {0}")]
    Unauthorized(String),

    /// Escrow cannot be released in its current state.
    #[error("cannot release escrow: {0}")]
    CannotRelease(String),

    /// Payment gateway call failed.
    #[error("payment gateway failure: {0}")]
    GatewayFailure(String),

    /// Candidate source could not supply runners.
    #[error("candidate source failure: {0}")]
    CandidateSource(String),

    /// Errand payload is invalid.
    #[error("invalid errand: {0}")]
    InvalidErrand(String),

    /// Rating payload is invalid.
    #[error("invalid rating: {0}")]
    InvalidRating(String),

    /// The rater already rated this user for the errand.
    #[error("rating already exists: {0}")]
    RatingAlreadyExists(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MarketError {
    /// Builds an [`MarketError::InvalidTransition`] from any displayable states.
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ErrandNotFound(_) | Self::OfferNotFound(_) | Self::EscrowNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::InvalidTransition { .. } | Self::CannotRelease(_) => ErrorKind::InvalidTransition,
            Self::EscrowAlreadyExists(_) | Self::RatingAlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::OfferExpired(_) | Self::ErrandExpired(_) => ErrorKind::Expired,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::GatewayFailure(_) | Self::CandidateSource(_) => ErrorKind::GatewayFailure,
            Self::InvalidErrand(_) | Self::InvalidRating(_) | Self::Config(_) => ErrorKind::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_transition() {
        let err = MarketError::invalid_transition("PENDING", "COMPLETED");
        assert_eq!(err.to_string(), "invalid state transition: PENDING -> COMPLETED");
    }

    #[test]
    fn error_display_offer_not_found() {
        let err = MarketError::OfferNotFound("offer-1".into());
        assert_eq!(
            err.to_string(),
            "offer not found or already processed: offer-1"
        );
    }

    #[test]
    fn error_kinds() {
        assert_eq!(MarketError::ErrandNotFound("e".into()).kind(), ErrorKind::NotFound);
        assert_eq!(MarketError::EscrowNotFound("e".into()).kind(), ErrorKind::NotFound);
        assert_eq!(MarketError::OfferExpired("o".into()).kind(), ErrorKind::Expired);
        assert_eq!(
            MarketError::EscrowAlreadyExists("e".into()).kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            MarketError::GatewayFailure("down".into()).kind(),
            ErrorKind::GatewayFailure
        );
        assert_eq!(MarketError::Unauthorized("x".into()).kind(), ErrorKind::Unauthorized);
        assert_eq!(
            MarketError::CannotRelease("no runner".into()).kind(),
            ErrorKind::InvalidTransition
        );
    }
}
