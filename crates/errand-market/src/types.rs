//! Core identifier and value types shared across the engine.
//!
//! - [`UserId`]: buyers and runners
//! - [`ErrandId`], [`OfferId`], [`EscrowId`]: record identifiers
//! - [`Coordinate`]: a latitude/longitude pair in degrees
//! - [`Task`]: one priced line item of an errand

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates an ID from an existing value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generates a new random ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a marketplace user (buyer or runner).
    UserId
);
string_id!(
    /// Identifier of an errand.
    ErrandId
);
string_id!(
    /// Identifier of an offer.
    OfferId
);
string_id!(
    /// Identifier of an escrow record.
    EscrowId
);

/// A point on the globe, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees, -90..=90.
    pub latitude: f64,
    /// Longitude in degrees, -180..=180.
    pub longitude: f64,
}

impl Coordinate {
    /// Creates a coordinate. No validation is done here; see [`Self::is_valid`].
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns true if both components are finite and within range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single priced task inside an errand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// What the runner should do.
    pub description: String,
    /// Price in currency minor units.
    pub price: u64,
}

impl Task {
    /// Creates a task.
    #[must_use]
    pub fn new(description: impl Into<String>, price: u64) -> Self {
        Self {
            description: description.into(),
            price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn ids_are_unique_and_display() {
        let a = ErrandId::generate();
        let b = ErrandId::generate();
        assert_ne!(a, b);
        assert_eq!(UserId::new("runner-1").to_string(), "runner-1");
        assert_eq!(OfferId::from("offer-9").as_str(), "offer-9");
    }

    #[test_case(0.0, 0.0, true ; "origin")]
    #[test_case(90.0, 180.0, true ; "upper bounds")]
    #[test_case(-90.0, -180.0, true ; "lower bounds")]
    #[test_case(90.5, 0.0, false ; "latitude out of range")]
    #[test_case(0.0, 181.0, false ; "longitude out of range")]
    #[test_case(f64::NAN, 0.0, false ; "nan latitude")]
    #[test_case(0.0, f64::INFINITY, false ; "infinite longitude")]
    fn coordinate_validity(lat: f64, lon: f64, expected: bool) {
        assert_eq!(Coordinate::new(lat, lon).is_valid(), expected);
    }

    #[test]
    fn task_serialization() {
        let task = Task::new("buy bread", 1000);
        let json = serde_json::to_string(&task).expect("serialize");
        let back: Task = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(task, back);
    }
}
