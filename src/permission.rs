//! Location permission state machine.
//!
//! [`PermissionGate`] keeps two concerns apart. Authorization *changes* (from
//! the prompt or from system settings) flow out through a `watch` channel that
//! anyone may observe. *Request resolution* goes through a table of pending
//! waiters keyed by request id, where installing a new waiter first resolves
//! every older one. A platform notification can therefore never resolve the
//! wrong caller, and no waiter is ever dropped without an answer.

use crate::config::PermissionConfig;
use crate::models::AuthorizationState;
use crate::platform::AuthorizationProvider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

pub struct PermissionGate {
    provider: Arc<dyn AuthorizationProvider>,
    safety_timeout: Duration,
    status: watch::Sender<AuthorizationState>,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<AuthorizationState>>,
}

/// Removes its waiter entry when the request finishes or is dropped.
struct WaiterGuard<'a> {
    gate: &'a PermissionGate,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.gate.waiters().pending.remove(&self.id);
    }
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn AuthorizationProvider>, config: &PermissionConfig) -> Self {
        let initial = provider.query_authorization();
        let (status, _rx) = watch::channel(initial);
        Self {
            provider,
            safety_timeout: config.safety_timeout(),
            status,
            waiters: Mutex::new(Waiters::default()),
        }
    }

    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks the platform directly; authorization can change outside the app.
    pub fn current_status(&self) -> AuthorizationState {
        let status = self.provider.query_authorization();
        self.publish(status);
        status
    }

    /// Prompts the user if the status is still undetermined.
    ///
    /// Resolves with the answer, with the platform's status once the safety
    /// timeout passes, or with the status at the time it was superseded by a
    /// newer request. Denied and Restricted are returned as-is, never retried.
    pub async fn request_permission(&self) -> AuthorizationState {
        let current = self.current_status();
        if current.is_determined() {
            return current;
        }

        let (id, superseded) = self.install_waiter(current);
        let _guard = WaiterGuard { gate: self, id };
        info!("Requesting location permission (request {})", id);

        let resolved = tokio::select! {
            answer = self.provider.request_authorization() => {
                info!("Location permission answered: {:?}", answer);
                self.publish(answer);
                answer
            }
            forced = superseded => {
                let forced = forced.unwrap_or(current);
                debug!("Permission request {} superseded, resolved with {:?}", id, forced);
                forced
            }
            _ = tokio::time::sleep(self.safety_timeout) => {
                let status = self.current_status();
                warn!(
                    "Permission prompt unanswered after {:?}, resolving with {:?}",
                    self.safety_timeout, status
                );
                status
            }
        };
        resolved
    }

    /// Resolves every outstanding waiter with `fallback`, then registers a new one.
    fn install_waiter(
        &self,
        fallback: AuthorizationState,
    ) -> (u64, oneshot::Receiver<AuthorizationState>) {
        let mut waiters = self.waiters();
        for (stale, tx) in waiters.pending.drain() {
            debug!("Force-resolving stale permission waiter {}", stale);
            let _ = tx.send(fallback);
        }
        let id = waiters.next_id;
        waiters.next_id += 1;
        let (tx, rx) = oneshot::channel();
        waiters.pending.insert(id, tx);
        (id, rx)
    }

    pub fn pending_requests(&self) -> usize {
        self.waiters().pending.len()
    }

    fn publish(&self, state: AuthorizationState) {
        self.status.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthorizationState> {
        self.status.subscribe()
    }

    /// Current status first, then every change.
    pub fn observe_authorization(&self) -> WatchStream<AuthorizationState> {
        WatchStream::new(self.status.subscribe())
    }

    /// Forwards platform-side status changes into this gate's channel.
    pub fn spawn_change_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let gate: Weak<Self> = Arc::downgrade(self);
        let mut changes = self.provider.authorization_changes();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = *changes.borrow_and_update();
                match gate.upgrade() {
                    Some(gate) => {
                        debug!("Authorization changed externally: {:?}", state);
                        gate.publish(state);
                    }
                    None => break,
                }
            }
        })
    }
}
