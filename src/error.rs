//! Error taxonomy for the location subsystem.
//!
//! None of these are meant to reach the user as a crash. Each variant maps to
//! a degraded-but-working state: a fallback coordinate, a placeholder address,
//! or a superseded request that the caller simply ignores.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// The user (or a device policy) refused location access. Terminal until
    /// the user changes it in system settings.
    #[error("location permission not granted")]
    PermissionDenied,

    /// No reading arrived inside the allotted wait.
    #[error("location request timed out")]
    Timeout,

    /// The platform receiver failed or could not be opened.
    #[error("location hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Reverse geocoding failed (network, rate limit, bad response).
    #[error("reverse geocoding failed: {0}")]
    GeocodeFailure(String),

    /// A newer request replaced this one before it could finish.
    #[error("request superseded by a newer one")]
    Superseded,
}

impl LocationError {
    /// Whether retrying on the next explicit request can help.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LocationError::PermissionDenied)
    }
}

impl From<reqwest::Error> for LocationError {
    fn from(e: reqwest::Error) -> Self {
        LocationError::GeocodeFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_permission_denial_is_terminal() {
        assert!(!LocationError::PermissionDenied.is_transient());
        assert!(LocationError::Timeout.is_transient());
        assert!(LocationError::HardwareUnavailable("gps off".into()).is_transient());
    }

    #[test]
    fn messages_name_the_cause() {
        let e = LocationError::HardwareUnavailable("receiver closed".into());
        assert_eq!(e.to_string(), "location hardware unavailable: receiver closed");
    }
}
