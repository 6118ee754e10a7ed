//! Great-circle distance between coordinates.
//!
//! Uses the Haversine formula on a sphere. Missing or invalid coordinates
//! produce `f64::INFINITY` so such runners always rank last.

use crate::types::Coordinate;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Returns the distance between two coordinates in meters.
///
/// # Examples
/// ```
/// use errand_market::geo::distance_m;
/// use errand_market::Coordinate;
///
/// let a = Coordinate::new(6.5244, 3.3792);
/// assert_eq!(distance_m(Some(a), Some(a)), 0.0);
/// assert!(distance_m(Some(a), None).is_infinite());
/// ```
#[must_use]
pub fn distance_m(a: Option<Coordinate>, b: Option<Coordinate>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return f64::INFINITY;
    };
    if !a.is_valid() || !b.is_valid() {
        return f64::INFINITY;
    }

    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Returns the distance between two coordinates in kilometers.
#[must_use]
pub fn distance_km(a: Option<Coordinate>, b: Option<Coordinate>) -> f64 {
    distance_m(a, b) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_zero() {
        let p = Coordinate::new(51.5074, -0.1278);
        assert!(distance_m(Some(p), Some(p)).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_coordinates_are_infinite() {
        let p = Coordinate::new(1.0, 1.0);
        assert!(distance_m(None, Some(p)).is_infinite());
        assert!(distance_m(Some(p), None).is_infinite());
        assert!(distance_m(None, None).is_infinite());
    }

    #[test]
    fn invalid_coordinates_are_infinite() {
        let p = Coordinate::new(1.0, 1.0);
        let bad = Coordinate::new(f64::NAN, 2.0);
        assert!(distance_m(Some(p), Some(bad)).is_infinite());
        let out_of_range = Coordinate::new(120.0, 2.0);
        assert!(distance_m(Some(out_of_range), Some(p)).is_infinite());
    }

    #[test]
    fn one_degree_of_latitude() {
        // 1 degree of arc on a 6371 km sphere is ~111.195 km.
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(1.0, 0.0);
        let d = distance_km(Some(a), Some(b));
        assert!((d - 111.195).abs() < 0.01, "got {d}");
    }

    #[test]
    fn known_city_pair() {
        // Lagos to Abuja is roughly 525 km as the crow flies.
        let lagos = Coordinate::new(6.5244, 3.3792);
        let abuja = Coordinate::new(9.0765, 7.3986);
        let d = distance_km(Some(lagos), Some(abuja));
        assert!((500.0..550.0).contains(&d), "got {d}");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn symmetric(
                lat1 in -90.0f64..=90.0, lon1 in -180.0f64..=180.0,
                lat2 in -90.0f64..=90.0, lon2 in -180.0f64..=180.0,
            ) {
                let a = Coordinate::new(lat1, lon1);
                let b = Coordinate::new(lat2, lon2);
                let ab = distance_m(Some(a), Some(b));
                let ba = distance_m(Some(b), Some(a));
                prop_assert!((ab - ba).abs() < 1e-6);
            }

            #[test]
            fn self_distance_zero(lat in -90.0f64..=90.0, lon in -180.0f64..=180.0) {
                let a = Coordinate::new(lat, lon);
                prop_assert!(distance_m(Some(a), Some(a)).abs() < 1e-9);
            }

            #[test]
            fn bounded_by_half_circumference(
                lat1 in -90.0f64..=90.0, lon1 in -180.0f64..=180.0,
                lat2 in -90.0f64..=90.0, lon2 in -180.0f64..=180.0,
            ) {
                let d = distance_m(
                    Some(Coordinate::new(lat1, lon1)),
                    Some(Coordinate::new(lat2, lon2)),
                );
                prop_assert!(d >= 0.0);
                prop_assert!(d <= std::f64::consts::PI * EARTH_RADIUS_M + 1.0);
            }
        }
    }
}
