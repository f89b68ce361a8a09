//! Seams to the operating system's location stack.
//!
//! Everything the subsystem needs from the platform goes through the traits in
//! this module: the authorization API ([`AuthorizationProvider`]) and the
//! location receiver ([`LocationHardware`] / [`LocationReceiver`]). Receivers
//! never touch shared state themselves. They push [`PlatformEvent`]s into a
//! [`ReadingSink`], and [`PositionSource`](crate::source::PositionSource)
//! drains that channel on its own task, which makes it the single writer of
//! the published position.

pub mod ip;
pub mod simulated;

use crate::error::LocationError;
use crate::models::{AuthorizationState, Position};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// What a receiver hands back from its callback thread.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Reading(Position),
    Failure(LocationError),
}

/// Hand-off point between platform callbacks and the subsystem.
pub type ReadingSink = mpsc::UnboundedSender<PlatformEvent>;

#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Current status straight from the platform, never cached.
    fn query_authorization(&self) -> AuthorizationState;

    /// Shows the system prompt and waits for the user's answer.
    async fn request_authorization(&self) -> AuthorizationState;

    /// Status changes made outside the app (e.g. in system settings).
    fn authorization_changes(&self) -> watch::Receiver<AuthorizationState>;
}

/// Factory for receivers. Opening a fresh receiver is how a stuck platform
/// manager gets reset.
pub trait LocationHardware: Send + Sync {
    fn open(&self, sink: ReadingSink) -> Result<Box<dyn LocationReceiver>, LocationError>;
}

pub trait LocationReceiver: Send {
    fn start_updates(&mut self) -> Result<(), LocationError>;
    fn stop_updates(&mut self);
    /// Ask for one reading as soon as possible, independent of the update stream.
    fn request_location(&mut self) -> Result<(), LocationError>;
}

/// Desktop stand-in for the OS prompt: answers with a configured decision.
pub struct ConfiguredAuthorization {
    granted: bool,
    tx: watch::Sender<AuthorizationState>,
}

impl ConfiguredAuthorization {
    pub fn new(granted: bool) -> Self {
        let (tx, _rx) = watch::channel(AuthorizationState::Undetermined);
        Self { granted, tx }
    }
}

#[async_trait]
impl AuthorizationProvider for ConfiguredAuthorization {
    fn query_authorization(&self) -> AuthorizationState {
        *self.tx.borrow()
    }

    async fn request_authorization(&self) -> AuthorizationState {
        let answer = if self.granted {
            AuthorizationState::AuthorizedWhileInUse
        } else {
            AuthorizationState::Denied
        };
        self.tx.send_replace(answer);
        answer
    }

    fn authorization_changes(&self) -> watch::Receiver<AuthorizationState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configured_authorization_answers_once_asked() {
        let auth = ConfiguredAuthorization::new(false);
        let mut changes = auth.authorization_changes();
        assert_eq!(auth.query_authorization(), AuthorizationState::Undetermined);

        assert_eq!(auth.request_authorization().await, AuthorizationState::Denied);
        assert_eq!(auth.query_authorization(), AuthorizationState::Denied);
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), AuthorizationState::Denied);
    }
}
