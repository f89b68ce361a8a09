use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A bare WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// NYU Tandon, the fallback used whenever no real position is available.
    pub const CAMPUS: Coordinate = Coordinate {
        latitude: 40.693393,
        longitude: -73.98555,
    };

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let phi1 = self.latitude.to_radians();
        let phi2 = other.latitude.to_radians();
        let d_phi = (other.latitude - self.latitude).to_radians();
        let d_lambda = (other.longitude - self.longitude).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// One accepted reading from the platform receiver. Immutable; replaced, never edited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Radius of uncertainty in meters.
    pub horizontal_accuracy: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>, horizontal_accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            horizontal_accuracy,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        self.coordinate().distance_to(&other.coordinate())
    }
}

/// Mirrors the platform's location authorization states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthorizationState {
    #[default]
    Undetermined,
    Denied,
    Restricted,
    AuthorizedWhileInUse,
    AuthorizedAlways,
}

impl AuthorizationState {
    pub fn is_authorized(self) -> bool {
        matches!(
            self,
            AuthorizationState::AuthorizedWhileInUse | AuthorizationState::AuthorizedAlways
        )
    }

    pub fn is_determined(self) -> bool {
        self != AuthorizationState::Undetermined
    }

    /// Denied or Restricted. No retry until the user changes it externally.
    pub fn is_refused(self) -> bool {
        matches!(
            self,
            AuthorizationState::Denied | AuthorizationState::Restricted
        )
    }
}

/// Output of the reverse-geocoding pipeline.
///
/// A stale result belongs to a position that was superseded before the lookup
/// finished; it must be discarded instead of displayed.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    pub address: Option<String>,
    pub for_position: Position,
    pub is_stale: bool,
}

impl GeocodeResult {
    pub fn fresh(address: Option<String>, for_position: Position) -> Self {
        Self {
            address,
            for_position,
            is_stale: false,
        }
    }

    pub fn stale(for_position: Position) -> Self {
        Self {
            address: None,
            for_position,
            is_stale: true,
        }
    }
}

/// Which input currently drives the map camera.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraTarget {
    FollowingUser,
    ShowingDestination { coordinate: Coordinate, name: String },
    ManualOverride,
}

impl CameraTarget {
    /// Higher wins when inputs compete.
    pub fn priority(&self) -> u8 {
        match self {
            CameraTarget::FollowingUser => 0,
            CameraTarget::ManualOverride => 1,
            CameraTarget::ShowingDestination { .. } => 2,
        }
    }
}

/// Visible map region: a center and a square span in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub center: Coordinate,
    pub span_deg: f64,
}

impl Viewport {
    pub fn new(center: Coordinate, span_deg: f64) -> Self {
        Self { center, span_deg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_longitude_step_at_equator_is_about_33_meters() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(0.0, 0.0003);
        let d = a.distance_to(&b);
        assert!((d - 33.36).abs() < 0.1, "got {d}");
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = Coordinate::CAMPUS;
        let b = Coordinate::new(40.7306, -73.9973);
        assert_eq!(a.distance_to(&a), 0.0);
        assert!((a.distance_to(&b) - b.distance_to(&a)).abs() < 1e-6);
        // Tandon to Washington Square is a bit over 4 km.
        assert!(a.distance_to(&b) > 4_000.0 && a.distance_to(&b) < 5_000.0);
    }

    #[test]
    fn authorization_classification() {
        assert!(AuthorizationState::AuthorizedAlways.is_authorized());
        assert!(AuthorizationState::AuthorizedWhileInUse.is_authorized());
        assert!(!AuthorizationState::Undetermined.is_determined());
        assert!(AuthorizationState::Restricted.is_refused());
        assert!(!AuthorizationState::Undetermined.is_refused());
    }

    #[test]
    fn destination_outranks_manual_outranks_follow() {
        let dest = CameraTarget::ShowingDestination {
            coordinate: Coordinate::CAMPUS,
            name: "Tandon".into(),
        };
        assert!(dest.priority() > CameraTarget::ManualOverride.priority());
        assert!(CameraTarget::ManualOverride.priority() > CameraTarget::FollowingUser.priority());
    }
}
