//! The live position stream.
//!
//! [`PositionSource`] owns the platform receiver and is the only writer of the
//! published position. Raw readings arrive on an mpsc channel from the
//! receiver's callback context and are applied one at a time by a pump task:
//!
//! * a reading older than the newest one seen is dropped (temporal order),
//! * the first reading is always accepted,
//! * later readings are accepted only if they moved more than the movement
//!   threshold away from the last accepted one. Readings inside the threshold
//!   still *confirm* the last position, which keeps it fresh for the
//!   acquisition fast path without churning subscribers.
//!
//! Errors are published on their own channel rather than returned, so the map
//! and the address badge can fall back to the default coordinate instead of
//! failing.

use crate::error::LocationError;
use crate::models::Position;
use crate::permission::PermissionGate;
use crate::platform::{LocationHardware, LocationReceiver, PlatformEvent};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// What happened to one platform event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ingest {
    Accepted,
    /// Within the movement threshold of the last accepted reading.
    Confirmed { distance_m: f64 },
    OutOfOrder,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct Accepted {
    position: Position,
    confirmed_at: Instant,
}

#[derive(Default)]
struct SourceState {
    last: Option<Accepted>,
    newest_seen: Option<DateTime<Utc>>,
    receiver: Option<Box<dyn LocationReceiver>>,
    pump: Option<JoinHandle<()>>,
}

pub struct PositionSource {
    hardware: Arc<dyn LocationHardware>,
    gate: Arc<PermissionGate>,
    movement_threshold_m: f64,
    state: Mutex<SourceState>,
    latest: watch::Sender<Option<Position>>,
    updates: broadcast::Sender<Position>,
    errors: watch::Sender<Option<LocationError>>,
}

impl PositionSource {
    pub fn new(
        hardware: Arc<dyn LocationHardware>,
        gate: Arc<PermissionGate>,
        movement_threshold_m: f64,
    ) -> Arc<Self> {
        let (latest, _) = watch::channel(None);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (errors, _) = watch::channel(None);
        Arc::new(Self {
            hardware,
            gate,
            movement_threshold_m,
            state: Mutex::new(SourceState::default()),
            latest,
            updates,
            errors,
        })
    }

    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn movement_threshold_m(&self) -> f64 {
        self.movement_threshold_m
    }

    /// Begins continuous updates. Without authorization this is a no-op that
    /// publishes (and returns) `PermissionDenied`.
    pub fn start(self: &Arc<Self>) -> Result<(), LocationError> {
        let status = self.gate.current_status();
        if !status.is_authorized() {
            warn!("Not starting location updates, authorization is {:?}", status);
            self.publish_error(LocationError::PermissionDenied);
            return Err(LocationError::PermissionDenied);
        }

        let mut state = self.state();
        if state.receiver.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = match self.hardware.open(tx) {
            Ok(receiver) => receiver,
            Err(e) => {
                error!("Could not open location receiver: {}", e);
                drop(state);
                self.publish_error(e.clone());
                return Err(e);
            }
        };
        if let Err(e) = receiver.start_updates() {
            error!("Location receiver refused to start: {}", e);
            drop(state);
            self.publish_error(e.clone());
            return Err(e);
        }

        state.pump = Some(self.spawn_pump(rx));
        state.receiver = Some(receiver);
        drop(state);
        // Errors from an earlier receiver no longer apply.
        self.errors.send_if_modified(|e| e.take().is_some());
        info!(
            "Location updates started (movement threshold: {}m)",
            self.movement_threshold_m
        );
        Ok(())
    }

    /// Halts updates and releases the receiver. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut state = self.state();
        if Self::teardown(&mut state) {
            info!("Location updates stopped");
        }
    }

    /// Access was withdrawn outside the app: release the receiver and publish
    /// `PermissionDenied` so subscribers fall back.
    pub fn revoke(&self) {
        let mut state = self.state();
        if Self::teardown(&mut state) {
            info!("Location updates stopped, access revoked");
        }
        drop(state);
        self.publish_error(LocationError::PermissionDenied);
    }

    /// Tears down and reopens the receiver. Platforms sometimes stop
    /// delivering after a long stay in the background; a fresh receiver is
    /// the only reliable recovery.
    pub fn restart(self: &Arc<Self>) -> Result<(), LocationError> {
        info!("Restarting location receiver");
        self.stop();
        self.errors.send_replace(None);
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.state().receiver.is_some()
    }

    /// Asks the receiver for one reading now, starting updates first if needed.
    pub fn request_fresh_reading(self: &Arc<Self>) -> Result<(), LocationError> {
        if !self.is_running() {
            self.start()?;
        }
        let result = match self.state().receiver.as_mut() {
            Some(receiver) => receiver.request_location(),
            None => Err(LocationError::HardwareUnavailable("receiver closed".into())),
        };
        if let Err(e) = &result {
            warn!("Fresh location request failed: {}", e);
            self.publish_error(e.clone());
        }
        result
    }

    fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<PlatformEvent>) -> JoinHandle<()> {
        let source: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match source.upgrade() {
                    Some(source) => {
                        source.ingest(event);
                    }
                    None => break,
                }
            }
        })
    }

    /// Applies one platform event. All writes to the published position go
    /// through here, under the state lock, so they are applied in order.
    pub fn ingest(&self, event: PlatformEvent) -> Ingest {
        let mut state = self.state();
        let reading = match event {
            PlatformEvent::Reading(reading) => reading,
            PlatformEvent::Failure(e) => {
                if e == LocationError::PermissionDenied {
                    warn!("Location permission revoked while updating");
                    Self::teardown(&mut state);
                } else {
                    error!("Location hardware error: {}", e);
                }
                drop(state);
                self.publish_error(e);
                return Ingest::Error;
            }
        };

        if let Some(newest) = state.newest_seen {
            if reading.timestamp < newest {
                debug!(
                    "Dropping out-of-order reading from {} (newest is {})",
                    reading.timestamp, newest
                );
                return Ingest::OutOfOrder;
            }
        }
        state.newest_seen = Some(reading.timestamp);

        let now = Instant::now();
        if let Some(last) = state.last.as_mut() {
            let distance_m = last.position.distance_to(&reading);
            if distance_m <= self.movement_threshold_m {
                last.confirmed_at = now;
                debug!("Reading {:.1}m from last accepted, not publishing", distance_m);
                return Ingest::Confirmed { distance_m };
            }
        }

        state.last = Some(Accepted {
            position: reading,
            confirmed_at: now,
        });
        self.latest.send_replace(Some(reading));
        let _ = self.updates.send(reading);
        self.errors.send_if_modified(|e| e.take().is_some());
        debug!(
            "Accepted reading ({:.6}, {:.6}) ±{}m",
            reading.latitude, reading.longitude, reading.horizontal_accuracy
        );
        Ingest::Accepted
    }

    fn teardown(state: &mut SourceState) -> bool {
        let had_receiver = match state.receiver.take() {
            Some(mut receiver) => {
                receiver.stop_updates();
                true
            }
            None => false,
        };
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        had_receiver
    }

    fn publish_error(&self, e: LocationError) {
        self.errors.send_replace(Some(e));
    }

    pub fn last_known(&self) -> Option<Position> {
        self.state().last.map(|a| a.position)
    }

    /// The last accepted position if a reading confirmed it within `window`.
    pub fn fresh_position(&self, window: Duration) -> Option<Position> {
        self.state()
            .last
            .filter(|a| a.confirmed_at.elapsed() <= window)
            .map(|a| a.position)
    }

    /// The last accepted position if a reading confirmed it at or after `since`.
    pub fn confirmed_since(&self, since: Instant) -> Option<Position> {
        self.state()
            .last
            .filter(|a| a.confirmed_at >= since)
            .map(|a| a.position)
    }

    /// Forgets the cached position so the next acquisition has to hit the hardware.
    pub fn clear_last_known(&self) {
        self.state().last = None;
        self.latest.send_replace(None);
    }

    pub fn last_error(&self) -> Option<LocationError> {
        self.errors.borrow().clone()
    }

    /// Every accepted reading, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<Position> {
        self.updates.subscribe()
    }

    pub fn subscribe_latest(&self) -> watch::Receiver<Option<Position>> {
        self.latest.subscribe()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<LocationError>> {
        self.errors.subscribe()
    }

    /// Accepted readings as a stream. A subscriber that falls behind skips
    /// ahead rather than stalling the source.
    pub fn observe_position(&self) -> impl Stream<Item = Position> {
        BroadcastStream::new(self.updates.subscribe()).filter_map(|r| r.ok())
    }
}

impl Drop for PositionSource {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        Self::teardown(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PermissionConfig;
    use crate::models::AuthorizationState;
    use crate::platform::simulated::SimulatedPlatform;
    use chrono::TimeZone;

    fn at(secs: i64, lat: f64, lon: f64) -> Position {
        let t = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Position::new(lat, lon, t, 5.0)
    }

    fn source(platform: &SimulatedPlatform) -> Arc<PositionSource> {
        let gate = Arc::new(PermissionGate::new(
            Arc::new(platform.clone()),
            &PermissionConfig::default(),
        ));
        PositionSource::new(Arc::new(platform.clone()), gate, 50.0)
    }

    #[tokio::test]
    async fn reading_within_threshold_is_not_published() {
        let source = source(&SimulatedPlatform::authorized());
        let mut updates = source.subscribe();

        assert_eq!(source.ingest(PlatformEvent::Reading(at(0, 0.0, 0.0))), Ingest::Accepted);
        let second = source.ingest(PlatformEvent::Reading(at(1, 0.0, 0.0003)));
        assert!(matches!(second, Ingest::Confirmed { distance_m } if distance_m < 50.0));

        assert_eq!(source.last_known().unwrap().longitude, 0.0);
        assert_eq!(updates.try_recv().unwrap().longitude, 0.0);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishes_exactly_the_readings_that_moved_past_the_threshold() {
        let source = source(&SimulatedPlatform::authorized());
        let mut updates = source.subscribe();

        // Steps of ~33m along the equator: only every second one clears 50m
        // from the last accepted reading.
        for i in 0..7 {
            source.ingest(PlatformEvent::Reading(at(i, 0.0, 0.0003 * i as f64)));
        }

        let mut published = Vec::new();
        while let Ok(p) = updates.try_recv() {
            published.push((p.longitude / 0.0003).round() as i64);
        }
        assert_eq!(published, vec![0, 2, 4, 6]);
    }

    #[tokio::test]
    async fn older_reading_after_newer_one_is_ignored() {
        let source = source(&SimulatedPlatform::authorized());
        source.ingest(PlatformEvent::Reading(at(10, 0.0, 0.0)));

        assert_eq!(
            source.ingest(PlatformEvent::Reading(at(5, 1.0, 1.0))),
            Ingest::OutOfOrder
        );
        assert_eq!(source.last_known().unwrap().latitude, 0.0);
    }

    #[tokio::test]
    async fn start_without_permission_reports_instead_of_opening() {
        let platform = SimulatedPlatform::new(AuthorizationState::Denied);
        let source = source(&platform);

        assert_eq!(source.start(), Err(LocationError::PermissionDenied));
        assert_eq!(platform.receivers_opened(), 0);
        assert_eq!(source.last_error(), Some(LocationError::PermissionDenied));
    }

    #[tokio::test]
    async fn restart_reopens_the_receiver() {
        let platform = SimulatedPlatform::authorized();
        let source = source(&platform);

        source.start().unwrap();
        source.start().unwrap();
        assert_eq!(platform.receivers_opened(), 1);

        source.restart().unwrap();
        assert_eq!(platform.receivers_opened(), 2);
        assert!(platform.is_updating());

        source.stop();
        source.stop();
        assert!(!platform.is_updating());
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn pump_delivers_platform_readings() {
        let platform = SimulatedPlatform::authorized();
        let source = source(&platform);
        let mut latest = source.subscribe_latest();
        source.start().unwrap();

        assert!(platform.emit(at(0, 40.0, -73.0)));
        latest.changed().await.unwrap();
        assert_eq!(latest.borrow().unwrap().latitude, 40.0);
    }

    #[tokio::test]
    async fn revoked_permission_stops_updates_and_is_published() {
        let platform = SimulatedPlatform::authorized();
        let source = source(&platform);
        source.start().unwrap();

        source.ingest(PlatformEvent::Failure(LocationError::PermissionDenied));
        assert!(!source.is_running());
        assert_eq!(source.last_error(), Some(LocationError::PermissionDenied));
    }

    #[tokio::test]
    async fn revoking_without_a_receiver_failure_still_publishes() {
        let platform = SimulatedPlatform::authorized();
        let source = source(&platform);
        source.start().unwrap();

        source.revoke();
        assert!(!source.is_running());
        assert!(!platform.has_open_receiver());
        assert_eq!(source.last_error(), Some(LocationError::PermissionDenied));

        // Idempotent.
        source.revoke();
        assert_eq!(source.last_error(), Some(LocationError::PermissionDenied));
    }

    #[tokio::test]
    async fn open_failure_is_published() {
        let platform = SimulatedPlatform::authorized();
        platform.fail_next_open("no gps");
        let source = source(&platform);

        assert!(source.start().is_err());
        assert_eq!(
            source.last_error(),
            Some(LocationError::HardwareUnavailable("no gps".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirming_reading_keeps_position_fresh() {
        let source = source(&SimulatedPlatform::authorized());
        source.ingest(PlatformEvent::Reading(at(0, 0.0, 0.0)));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(source.fresh_position(Duration::from_secs(5)).is_none());

        source.ingest(PlatformEvent::Reading(at(8, 0.0, 0.0001)));
        assert!(source.fresh_position(Duration::from_secs(5)).is_some());

        source.clear_last_known();
        assert!(source.fresh_position(Duration::from_secs(5)).is_none());
    }
}
