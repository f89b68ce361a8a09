//! Composition root for the location subsystem.
//!
//! [`LocationSubsystem`] builds the permission gate, the position source, the
//! acquisition coordinator, the geocode throttle and the camera controller
//! from injected platform seams, wires the subscriptions between them, and
//! exposes the operations the rest of the app calls.

use crate::acquisition::{AcquisitionCoordinator, AcquisitionOutcome};
use crate::camera::{CameraController, CameraState};
use crate::config::Config;
use crate::geocode::{GeocodeThrottle, ReverseGeocoder};
use crate::models::{AuthorizationState, Coordinate, GeocodeResult, Position, Viewport};
use crate::permission::PermissionGate;
use crate::platform::{AuthorizationProvider, LocationHardware};
use crate::source::PositionSource;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;
use tracing::{info, warn};

/// The "finding your location" indicator. Always leaves `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
    /// No position in time (or no permission); showing the default coordinate.
    Fallback,
}

pub struct LocationSubsystem {
    gate: Arc<PermissionGate>,
    source: Arc<PositionSource>,
    coordinator: Arc<AcquisitionCoordinator>,
    geocode: Arc<GeocodeThrottle>,
    camera: Arc<CameraController>,
    fallback: Coordinate,
    initial_load_timeout: Duration,
    load: watch::Sender<LoadState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocationSubsystem {
    pub fn new(
        authorization: Arc<dyn AuthorizationProvider>,
        hardware: Arc<dyn LocationHardware>,
        geocoder: Arc<dyn ReverseGeocoder>,
        config: &Config,
    ) -> Arc<Self> {
        let fallback = config.location.default_coordinate();
        let gate = Arc::new(PermissionGate::new(authorization, &config.permission));
        let source = PositionSource::new(
            hardware,
            Arc::clone(&gate),
            config.location.movement_threshold_m,
        );
        let coordinator = AcquisitionCoordinator::new(
            Arc::clone(&source),
            Arc::clone(&gate),
            config.acquisition.clone(),
        );
        let geocode = GeocodeThrottle::new(
            geocoder,
            config.geocode.throttle_window(),
            config.geocode.placeholder.clone(),
        );
        let camera = CameraController::new(config.camera.clone(), fallback);
        let (load, _) = watch::channel(LoadState::Loading);

        Arc::new(Self {
            gate,
            source,
            coordinator,
            geocode,
            camera,
            fallback,
            initial_load_timeout: config.acquisition.initial_load_timeout(),
            load,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wires subscribers, asks for permission and starts continuous updates.
    pub async fn start(self: &Arc<Self>) -> AuthorizationState {
        {
            let mut tasks = self.tasks();
            tasks.push(self.gate.spawn_change_listener());
            tasks.push(self.geocode.follow(self.source.subscribe()));
            tasks.push(self.camera.follow(self.source.subscribe()));
            tasks.push(self.spawn_load_timeout());
        }

        let status = self.gate.request_permission().await;
        if status.is_authorized() {
            if let Err(e) = self.source.start() {
                warn!("Location updates unavailable, using default coordinate: {}", e);
            }
        } else {
            warn!("Location not authorized ({:?}), using default coordinate", status);
            self.finish_loading(LoadState::Fallback);
        }
        self.tasks().push(self.spawn_authorization_watch());
        info!("Location subsystem started ({:?})", status);
        status
    }

    /// Resolves `Ready` on the first position, `Fallback` after the initial
    /// load timeout.
    fn spawn_load_timeout(self: &Arc<Self>) -> JoinHandle<()> {
        let subsystem: Weak<Self> = Arc::downgrade(self);
        let mut latest = self.source.subscribe_latest();
        let timeout = self.initial_load_timeout;
        tokio::spawn(async move {
            let first = tokio::time::timeout(timeout, async {
                loop {
                    if latest.borrow_and_update().is_some() {
                        return true;
                    }
                    if latest.changed().await.is_err() {
                        return false;
                    }
                }
            })
            .await;
            if let Some(subsystem) = subsystem.upgrade() {
                match first {
                    Ok(true) => subsystem.finish_loading(LoadState::Ready),
                    _ => {
                        warn!("No position within {:?}, showing default coordinate", timeout);
                        subsystem.finish_loading(LoadState::Fallback)
                    }
                }
            }
        })
    }

    /// Starts or stops the receiver when access is granted or revoked in settings.
    fn spawn_authorization_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let subsystem: Weak<Self> = Arc::downgrade(self);
        let mut status = self.gate.subscribe();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let state = *status.borrow_and_update();
                let Some(this) = subsystem.upgrade() else {
                    break;
                };
                if state.is_authorized() && !this.source.is_running() {
                    info!("Location access granted, starting updates");
                    if let Err(e) = this.source.start() {
                        warn!("Could not start location updates after grant: {}", e);
                    }
                } else if state.is_refused() && this.source.is_running() {
                    info!("Location access revoked, stopping updates");
                    this.source.revoke();
                }
            }
        })
    }

    fn finish_loading(&self, state: LoadState) {
        self.load.send_if_modified(|current| {
            if *current == LoadState::Loading {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    pub async fn get_current_position(&self, timeout_ms: u64) -> AcquisitionOutcome {
        self.coordinator
            .get_current_position(Duration::from_millis(timeout_ms))
            .await
    }

    /// Position to use right now: acquired, or the default coordinate.
    pub async fn position_or_default(&self, timeout_ms: u64) -> Coordinate {
        self.get_current_position(timeout_ms)
            .await
            .coordinate_or(self.fallback)
    }

    pub async fn force_refresh(&self) -> AcquisitionOutcome {
        let outcome = self.coordinator.force_refresh().await;
        if let AcquisitionOutcome::Resolved(position) = outcome {
            self.camera.follow_at(position);
        }
        outcome
    }

    /// User tapped "recenter": the camera follows again right away, on the
    /// last known position, and a fresh acquisition refines it.
    pub async fn recenter(&self) -> AcquisitionOutcome {
        self.camera.recenter();
        self.force_refresh().await
    }

    /// App came back to the foreground. The receiver may have gone quiet in
    /// the background, so it is rebuilt before re-acquiring.
    pub async fn on_foreground(&self) -> AcquisitionOutcome {
        if self.gate.current_status().is_authorized() {
            if let Err(e) = self.source.restart() {
                warn!("Receiver restart failed: {}", e);
            }
        }
        self.force_refresh().await
    }

    pub fn select_destination(&self, coordinate: Coordinate, name: impl Into<String>) -> Viewport {
        self.camera.select_destination(coordinate, name)
    }

    pub fn clear_destination(&self) -> Option<Viewport> {
        self.camera.clear_destination()
    }

    pub fn manual_gesture(&self, viewport: Viewport) {
        self.camera.manual_gesture(viewport)
    }

    pub fn observe_position(&self) -> impl Stream<Item = Position> {
        self.source.observe_position()
    }

    pub fn observe_authorization(&self) -> WatchStream<AuthorizationState> {
        self.gate.observe_authorization()
    }

    pub fn subscribe_camera(&self) -> watch::Receiver<CameraState> {
        self.camera.subscribe()
    }

    pub fn subscribe_address(&self) -> watch::Receiver<Option<GeocodeResult>> {
        self.geocode.subscribe()
    }

    pub fn subscribe_load(&self) -> watch::Receiver<LoadState> {
        self.load.subscribe()
    }

    pub fn load_state(&self) -> LoadState {
        *self.load.borrow()
    }

    pub fn current_address(&self) -> String {
        self.geocode.current_address()
    }

    pub fn camera_state(&self) -> CameraState {
        self.camera.state()
    }

    pub fn authorization(&self) -> AuthorizationState {
        self.gate.current_status()
    }

    pub fn last_known(&self) -> Option<Position> {
        self.source.last_known()
    }

    pub fn fallback(&self) -> Coordinate {
        self.fallback
    }

    /// Optional `lat`/`lon` parameters for the recommendation backend.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        match self.source.last_known() {
            Some(p) => vec![
                ("lat", format!("{:.6}", p.latitude)),
                ("lon", format!("{:.6}", p.longitude)),
            ],
            None => Vec::new(),
        }
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn source(&self) -> &Arc<PositionSource> {
        &self.source
    }

    pub fn coordinator(&self) -> &Arc<AcquisitionCoordinator> {
        &self.coordinator
    }

    pub fn geocode(&self) -> &Arc<GeocodeThrottle> {
        &self.geocode
    }

    pub fn camera(&self) -> &Arc<CameraController> {
        &self.camera
    }

    /// Cancels everything in flight and releases the receiver.
    pub fn shutdown(&self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
        self.coordinator.cancel();
        self.source.stop();
        info!("Location subsystem shut down");
    }
}
