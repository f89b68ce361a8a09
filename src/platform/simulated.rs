//! A scriptable platform: authorization prompt, receiver and readings are all
//! driven by hand. Used by the test suite and by the `simulated` provider of
//! the demo binary.

use super::{
    AuthorizationProvider, LocationHardware, LocationReceiver, PlatformEvent, ReadingSink,
};
use crate::error::LocationError;
use crate::models::{AuthorizationState, Position};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct SimulatedPlatform {
    shared: Arc<Mutex<Shared>>,
    authorization: Arc<watch::Sender<AuthorizationState>>,
}

#[derive(Default)]
struct Shared {
    // None means the user never answers the prompt.
    prompt_answer: Option<AuthorizationState>,
    prompt_delay: Duration,
    prompts: usize,

    sink: Option<(u64, ReadingSink)>,
    next_receiver: u64,
    receivers_opened: usize,
    updating: bool,
    pending_requests: usize,
    location_requests: usize,
    fail_open: Option<String>,
    reply: Option<(Duration, Position)>,
}

impl SimulatedPlatform {
    pub fn new(initial: AuthorizationState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            authorization: Arc::new(tx),
        }
    }

    /// A platform that has already granted while-in-use access.
    pub fn authorized() -> Self {
        Self::new(AuthorizationState::AuthorizedWhileInUse)
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How the user will answer the next system prompt, and how long they take.
    pub fn answer_prompt_with(&self, answer: Option<AuthorizationState>, delay: Duration) {
        let mut shared = self.shared();
        shared.prompt_answer = answer;
        shared.prompt_delay = delay;
    }

    /// Changes authorization from "outside the app". Revoking access while a
    /// receiver is open reports the failure through it, as a real platform does.
    pub fn set_authorization(&self, state: AuthorizationState) {
        self.authorization.send_replace(state);
        if state.is_refused() {
            let shared = self.shared();
            if let Some((_, sink)) = &shared.sink {
                let _ = sink.send(PlatformEvent::Failure(LocationError::PermissionDenied));
            }
        }
    }

    /// Answer every `request_location` with `position` after `delay`.
    pub fn reply_to_requests(&self, delay: Duration, position: Position) {
        self.shared().reply = Some((delay, position));
    }

    /// Make the next `open` fail, as if the hardware were missing.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.shared().fail_open = Some(reason.into());
    }

    /// Delivers a raw reading if the receiver is running or owes a requested
    /// reading. Returns whether it went out.
    pub fn emit(&self, position: Position) -> bool {
        deliver(&self.shared, position)
    }

    /// Reports a hardware failure through the open receiver.
    pub fn fail(&self, reason: impl Into<String>) {
        let shared = self.shared();
        if let Some((_, sink)) = &shared.sink {
            let _ = sink.send(PlatformEvent::Failure(LocationError::HardwareUnavailable(
                reason.into(),
            )));
        }
    }

    pub fn receivers_opened(&self) -> usize {
        self.shared().receivers_opened
    }

    pub fn location_requests(&self) -> usize {
        self.shared().location_requests
    }

    pub fn prompts_shown(&self) -> usize {
        self.shared().prompts
    }

    pub fn is_updating(&self) -> bool {
        self.shared().updating
    }

    pub fn has_open_receiver(&self) -> bool {
        self.shared().sink.is_some()
    }
}

fn deliver(shared: &Mutex<Shared>, position: Position) -> bool {
    let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
    if !shared.updating && shared.pending_requests == 0 {
        return false;
    }
    let Some((_, sink)) = &shared.sink else {
        return false;
    };
    let sent = sink.send(PlatformEvent::Reading(position)).is_ok();
    if sent && !shared.updating {
        shared.pending_requests -= 1;
    }
    sent
}

#[async_trait]
impl AuthorizationProvider for SimulatedPlatform {
    fn query_authorization(&self) -> AuthorizationState {
        *self.authorization.borrow()
    }

    async fn request_authorization(&self) -> AuthorizationState {
        let (answer, delay) = {
            let mut shared = self.shared();
            shared.prompts += 1;
            (shared.prompt_answer, shared.prompt_delay)
        };
        match answer {
            Some(answer) => {
                tokio::time::sleep(delay).await;
                self.authorization.send_replace(answer);
                answer
            }
            None => std::future::pending().await,
        }
    }

    fn authorization_changes(&self) -> watch::Receiver<AuthorizationState> {
        self.authorization.subscribe()
    }
}

impl LocationHardware for SimulatedPlatform {
    fn open(&self, sink: ReadingSink) -> Result<Box<dyn LocationReceiver>, LocationError> {
        let mut shared = self.shared();
        if let Some(reason) = shared.fail_open.take() {
            return Err(LocationError::HardwareUnavailable(reason));
        }
        let id = shared.next_receiver;
        shared.next_receiver += 1;
        shared.receivers_opened += 1;
        shared.updating = false;
        shared.pending_requests = 0;
        shared.sink = Some((id, sink));
        Ok(Box::new(SimulatedReceiver {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct SimulatedReceiver {
    id: u64,
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedReceiver {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, shared: &Shared) -> bool {
        matches!(&shared.sink, Some((id, _)) if *id == self.id)
    }
}

impl LocationReceiver for SimulatedReceiver {
    fn start_updates(&mut self) -> Result<(), LocationError> {
        let mut shared = self.shared();
        if !self.is_current(&shared) {
            return Err(LocationError::HardwareUnavailable("receiver closed".into()));
        }
        shared.updating = true;
        Ok(())
    }

    fn stop_updates(&mut self) {
        let mut shared = self.shared();
        if self.is_current(&shared) {
            shared.updating = false;
            shared.pending_requests = 0;
        }
    }

    fn request_location(&mut self) -> Result<(), LocationError> {
        let reply = {
            let mut shared = self.shared();
            if !self.is_current(&shared) {
                return Err(LocationError::HardwareUnavailable("receiver closed".into()));
            }
            shared.location_requests += 1;
            shared.pending_requests += 1;
            shared.reply
        };
        if let Some((delay, position)) = reply {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let shared = Arc::clone(&self.shared);
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    deliver(&shared, position);
                });
            }
        }
        Ok(())
    }
}

impl Drop for SimulatedReceiver {
    fn drop(&mut self) {
        let mut shared = self.shared();
        if self.is_current(&shared) {
            shared.sink = None;
            shared.updating = false;
            shared.pending_requests = 0;
        }
    }
}
