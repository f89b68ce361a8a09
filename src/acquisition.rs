//! "Give me a position now, but don't make me wait forever."
//!
//! [`AcquisitionCoordinator`] runs at most one acquisition at a time. Each
//! request gets an id, a deadline and a driver task that races a polling loop
//! against the deadline. The one-shot resolver for a request lives only in the
//! coordinator's table and is taken out under the lock exactly once, whether
//! by the driver, by the caller's own deadline guard, or by a newer request
//! superseding it. A cancelled driver has nothing left to resolve with, so two
//! resolutions of one request cannot happen.
//!
//! Phases: `Idle -> Requesting -> Resolved | TimedOut | Failed`.

use crate::config::AcquisitionConfig;
use crate::error::LocationError;
use crate::models::{Coordinate, Position};
use crate::permission::PermissionGate;
use crate::source::PositionSource;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Slack on top of the caller's timeout before the caller stops waiting on
/// the driver and resolves the request itself.
const RESOLUTION_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionOutcome {
    Resolved(Position),
    TimedOut,
    /// A newer request (or an explicit cancel) replaced this one.
    Superseded,
    Failed(LocationError),
}

impl AcquisitionOutcome {
    pub fn position(&self) -> Option<Position> {
        match self {
            AcquisitionOutcome::Resolved(p) => Some(*p),
            _ => None,
        }
    }

    /// Where to center things when the acquisition didn't produce a position.
    pub fn coordinate_or(&self, fallback: Coordinate) -> Coordinate {
        self.position().map(|p| p.coordinate()).unwrap_or(fallback)
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, AcquisitionOutcome::Resolved(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionPhase {
    #[default]
    Idle,
    Requesting,
    Resolved,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionRequest {
    pub id: u64,
    pub started_at: Instant,
    pub timeout_at: Instant,
    pub resolved: bool,
}

struct ActiveRequest {
    request: AcquisitionRequest,
    resolver: oneshot::Sender<AcquisitionOutcome>,
    driver: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct CoordinatorState {
    next_id: u64,
    active: Option<ActiveRequest>,
    last_request: Option<AcquisitionRequest>,
}

/// Counts live polling loops; decremented when the loop's future is dropped.
struct PollGuard(Arc<AtomicUsize>);

impl PollGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct AcquisitionCoordinator {
    source: Arc<PositionSource>,
    gate: Arc<PermissionGate>,
    config: AcquisitionConfig,
    state: Mutex<CoordinatorState>,
    phase: watch::Sender<AcquisitionPhase>,
    active_polls: Arc<AtomicUsize>,
}

impl AcquisitionCoordinator {
    pub fn new(
        source: Arc<PositionSource>,
        gate: Arc<PermissionGate>,
        config: AcquisitionConfig,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(AcquisitionPhase::Idle);
        Arc::new(Self {
            source,
            gate,
            config,
            state: Mutex::new(CoordinatorState::default()),
            phase,
            active_polls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Resolves with a position, or with `TimedOut` no later than `timeout`
    /// (plus a small grace) for any source behavior.
    pub async fn get_current_position(self: &Arc<Self>, timeout: Duration) -> AcquisitionOutcome {
        let status = self.gate.current_status();
        if status.is_refused() {
            warn!("Location acquisition refused, authorization is {:?}", status);
            if self.state().active.is_none() {
                self.phase.send_replace(AcquisitionPhase::Failed);
            }
            return AcquisitionOutcome::Failed(LocationError::PermissionDenied);
        }

        if let Some(position) = self.source.fresh_position(self.config.freshness_window()) {
            debug!("Serving cached position, still inside the freshness window");
            return AcquisitionOutcome::Resolved(position);
        }

        let (request, rx) = self.begin(timeout);
        match tokio::time::timeout(timeout + RESOLUTION_GRACE, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Resolver dropped unsent: only possible if the coordinator itself went away.
            Ok(Err(_)) => AcquisitionOutcome::Superseded,
            Err(_) => {
                warn!("Acquisition {} driver overran its deadline", request.id);
                self.resolve(request.id, AcquisitionOutcome::TimedOut);
                AcquisitionOutcome::TimedOut
            }
        }
    }

    /// Acquires with the configured default timeout.
    pub async fn current_position(self: &Arc<Self>) -> AcquisitionOutcome {
        self.get_current_position(self.config.default_timeout()).await
    }

    /// Cancels anything in flight, forgets the cached position and acquires anew.
    pub async fn force_refresh(self: &Arc<Self>) -> AcquisitionOutcome {
        info!("Forcing a fresh location acquisition");
        self.cancel();
        self.source.clear_last_known();
        self.current_position().await
    }

    /// Cancels the active request, resolving its caller with `Superseded`.
    /// Returns whether anything was cancelled; repeated calls are no-ops.
    pub fn cancel(&self) -> bool {
        let mut state = self.state();
        match state.active.take() {
            Some(active) => {
                let id = active.request.id;
                Self::retire(&mut state, active, AcquisitionOutcome::Superseded);
                drop(state);
                self.phase.send_replace(AcquisitionPhase::Idle);
                debug!("Acquisition {} cancelled", id);
                true
            }
            None => false,
        }
    }

    /// Installs a new active request, superseding the previous one first.
    fn begin(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> (AcquisitionRequest, oneshot::Receiver<AcquisitionOutcome>) {
        let mut state = self.state();
        if let Some(previous) = state.active.take() {
            info!("Acquisition {} superseded", previous.request.id);
            Self::retire(&mut state, previous, AcquisitionOutcome::Superseded);
        }

        let id = state.next_id;
        state.next_id += 1;
        let started_at = Instant::now();
        let request = AcquisitionRequest {
            id,
            started_at,
            timeout_at: started_at + timeout,
            resolved: false,
        };

        let (tx, rx) = oneshot::channel();
        let driver = tokio::spawn(Arc::clone(self).drive(request));
        state.active = Some(ActiveRequest {
            request,
            resolver: tx,
            driver: Some(driver),
        });
        state.last_request = Some(request);
        drop(state);

        self.phase.send_replace(AcquisitionPhase::Requesting);
        debug!("Acquisition {} started, deadline in {:?}", id, timeout);
        (request, rx)
    }

    /// Aborts the driver and hands the caller its final outcome.
    fn retire(state: &mut CoordinatorState, mut active: ActiveRequest, outcome: AcquisitionOutcome) {
        if let Some(driver) = active.driver.take() {
            driver.abort();
        }
        if let Some(last) = state.last_request.as_mut() {
            if last.id == active.request.id {
                last.resolved = true;
            }
        }
        let _ = active.resolver.send(outcome);
    }

    /// Resolves request `id` if it is still the active one.
    fn resolve(&self, id: u64, outcome: AcquisitionOutcome) -> bool {
        let mut state = self.state();
        if state.active.as_ref().map(|a| a.request.id) != Some(id) {
            return false;
        }
        let Some(mut active) = state.active.take() else {
            return false;
        };
        // The driver may be the one calling; it finishes right after this.
        active.driver.take();

        let phase = match &outcome {
            AcquisitionOutcome::Resolved(_) => AcquisitionPhase::Resolved,
            AcquisitionOutcome::TimedOut => AcquisitionPhase::TimedOut,
            AcquisitionOutcome::Failed(_) => AcquisitionPhase::Failed,
            AcquisitionOutcome::Superseded => AcquisitionPhase::Idle,
        };
        info!("Acquisition {} resolved: {:?}", id, phase);
        Self::retire(&mut state, active, outcome);
        drop(state);
        self.phase.send_replace(phase);
        true
    }

    async fn drive(self: Arc<Self>, request: AcquisitionRequest) {
        let outcome = tokio::select! {
            outcome = self.acquire(request) => outcome,
            _ = tokio::time::sleep_until(request.timeout_at) => self.timed_out(request.id),
        };
        self.resolve(request.id, outcome);
    }

    async fn acquire(&self, request: AcquisitionRequest) -> AcquisitionOutcome {
        let mut status = self.gate.current_status();
        if !status.is_determined() {
            status = self.gate.request_permission().await;
        }
        if status.is_refused() {
            return AcquisitionOutcome::Failed(LocationError::PermissionDenied);
        }
        if !status.is_authorized() {
            warn!("Permission still undetermined, giving up on acquisition {}", request.id);
            return AcquisitionOutcome::TimedOut;
        }

        match self.source.request_fresh_reading() {
            Ok(()) => {}
            Err(LocationError::PermissionDenied) => {
                return AcquisitionOutcome::Failed(LocationError::PermissionDenied)
            }
            Err(e) => {
                error!("Acquisition {}: location hardware unavailable: {}", request.id, e);
                return AcquisitionOutcome::TimedOut;
            }
        }

        self.poll(request).await
    }

    /// Checks the source once per interval until a reading confirmed after the
    /// request started shows up or the attempts run out.
    async fn poll(&self, request: AcquisitionRequest) -> AcquisitionOutcome {
        let _guard = PollGuard::enter(&self.active_polls);
        let mut ticker = tokio::time::interval(self.config.poll_interval());

        for attempt in 0..=self.config.max_attempts {
            ticker.tick().await;
            if !self.is_active(request.id) {
                return AcquisitionOutcome::Superseded;
            }
            if let Some(position) = self.source.confirmed_since(request.started_at) {
                debug!("Acquisition {} got a reading on attempt {}", request.id, attempt);
                return AcquisitionOutcome::Resolved(position);
            }
            if self.gate.current_status().is_refused()
                || self.source.last_error() == Some(LocationError::PermissionDenied)
            {
                warn!("Acquisition {}: location access revoked", request.id);
                return AcquisitionOutcome::Failed(LocationError::PermissionDenied);
            }
        }
        self.timed_out(request.id)
    }

    fn timed_out(&self, id: u64) -> AcquisitionOutcome {
        match self.source.last_error() {
            Some(LocationError::HardwareUnavailable(reason)) => {
                error!("Acquisition {} timed out, hardware unavailable: {}", id, reason)
            }
            _ => warn!("Acquisition {} timed out without a reading", id),
        }
        AcquisitionOutcome::TimedOut
    }

    fn is_active(&self, id: u64) -> bool {
        self.state().active.as_ref().map(|a| a.request.id) == Some(id)
    }

    pub fn phase(&self) -> AcquisitionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<AcquisitionPhase> {
        self.phase.subscribe()
    }

    pub fn active_request(&self) -> Option<AcquisitionRequest> {
        self.state().active.as_ref().map(|a| a.request)
    }

    pub fn last_request(&self) -> Option<AcquisitionRequest> {
        self.state().last_request
    }

    /// Number of polling loops currently alive. Never more than one.
    pub fn active_polls(&self) -> usize {
        self.active_polls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PermissionConfig;
    use crate::models::AuthorizationState;
    use crate::platform::simulated::SimulatedPlatform;
    use crate::platform::PlatformEvent;
    use chrono::Utc;

    fn coordinator(platform: &SimulatedPlatform) -> (Arc<AcquisitionCoordinator>, Arc<PositionSource>) {
        let gate = Arc::new(PermissionGate::new(
            Arc::new(platform.clone()),
            &PermissionConfig::default(),
        ));
        let source = PositionSource::new(Arc::new(platform.clone()), Arc::clone(&gate), 50.0);
        let coordinator =
            AcquisitionCoordinator::new(Arc::clone(&source), gate, AcquisitionConfig::default());
        (coordinator, source)
    }

    fn reading(lat: f64) -> Position {
        Position::new(lat, -73.98, Utc::now(), 8.0)
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cached_reading_skips_the_hardware() {
        let platform = SimulatedPlatform::authorized();
        let (coordinator, source) = coordinator(&platform);
        source.ingest(PlatformEvent::Reading(reading(40.69)));

        let outcome = coordinator.get_current_position(Duration::from_secs(5)).await;
        assert_eq!(outcome.position().unwrap().latitude, 40.69);
        assert_eq!(platform.location_requests(), 0);
        assert_eq!(coordinator.phase(), AcquisitionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_permission_fails_without_touching_hardware() {
        let platform = SimulatedPlatform::new(AuthorizationState::Denied);
        let (coordinator, _source) = coordinator(&platform);

        let outcome = coordinator.get_current_position(Duration::from_secs(5)).await;
        assert_eq!(outcome, AcquisitionOutcome::Failed(LocationError::PermissionDenied));
        assert_eq!(coordinator.phase(), AcquisitionPhase::Failed);
        assert_eq!(platform.receivers_opened(), 0);
        assert_eq!(outcome.coordinate_or(Coordinate::CAMPUS), Coordinate::CAMPUS);
    }

    #[tokio::test(start_paused = true)]
    async fn reading_that_arrives_in_time_resolves() {
        let platform = SimulatedPlatform::authorized();
        platform.reply_to_requests(Duration::from_millis(2_500), reading(40.70));
        let (coordinator, _source) = coordinator(&platform);

        let started = Instant::now();
        let outcome = coordinator.get_current_position(Duration::from_secs(10)).await;
        assert_eq!(outcome.position().unwrap().latitude, 40.70);
        // Seen on the poll after it landed.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_millis(3_100));
        assert_eq!(coordinator.phase(), AcquisitionPhase::Resolved);
        assert_eq!(coordinator.active_polls(), 0);
        assert!(coordinator.last_request().unwrap().resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_still_resolves() {
        let platform = SimulatedPlatform::authorized();
        platform.reply_to_requests(Duration::from_millis(100), reading(40.70));
        let gate = Arc::new(PermissionGate::new(
            Arc::new(platform.clone()),
            &PermissionConfig::default(),
        ));
        let source = PositionSource::new(Arc::new(platform.clone()), Arc::clone(&gate), 50.0);
        let config = AcquisitionConfig {
            poll_interval_ms: 0,
            ..AcquisitionConfig::default()
        };
        let coordinator = AcquisitionCoordinator::new(source, gate, config);

        let outcome = coordinator.get_current_position(Duration::from_secs(5)).await;
        assert_eq!(outcome.position().unwrap().latitude, 40.70);
        assert_eq!(coordinator.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_that_cannot_open_times_out_early() {
        let platform = SimulatedPlatform::authorized();
        platform.fail_next_open("receiver missing");
        let (coordinator, _source) = coordinator(&platform);

        let outcome = coordinator.get_current_position(Duration::from_secs(10)).await;
        assert_eq!(outcome, AcquisitionOutcome::TimedOut);
        assert_eq!(coordinator.phase(), AcquisitionPhase::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let platform = SimulatedPlatform::authorized();
        let (coordinator, _source) = coordinator(&platform);
        assert!(!coordinator.cancel());

        let pending = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.get_current_position(Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(coordinator.cancel());
        assert!(!coordinator.cancel());
        assert_eq!(pending.await.unwrap(), AcquisitionOutcome::Superseded);
        assert_eq!(coordinator.phase(), AcquisitionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn force_refresh_ignores_the_cache() {
        let platform = SimulatedPlatform::authorized();
        let (coordinator, source) = coordinator(&platform);
        source.ingest(PlatformEvent::Reading(reading(40.69)));
        platform.reply_to_requests(Duration::from_millis(300), reading(40.75));

        let outcome = coordinator.force_refresh().await;
        assert_eq!(outcome.position().unwrap().latitude, 40.75);
        assert_eq!(platform.location_requests(), 1);
    }
}
