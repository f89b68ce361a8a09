//! Map camera policy.
//!
//! The camera has three masters, in priority order: a selected destination,
//! the user's own pan/zoom, and the live position. Following the live
//! position is double-gated: a position must clear the camera's own distance
//! bound (much larger than the source's movement filter) *and* the camera
//! throttle window must have passed since the last automatic move.

use crate::config::CameraConfig;
use crate::models::{CameraTarget, Coordinate, Position, Viewport};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// What the map surface renders.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraState {
    pub target: CameraTarget,
    pub viewport: Viewport,
    /// Live position marker. Drawn regardless of what the camera follows.
    pub user_marker: Option<Position>,
}

struct Inner {
    state: CameraState,
    // Where and when the camera last moved on its own or was recentered.
    last_follow: Option<(Coordinate, Instant)>,
}

pub struct CameraController {
    config: CameraConfig,
    fallback: Coordinate,
    inner: Mutex<Inner>,
    camera: watch::Sender<CameraState>,
}

impl CameraController {
    pub fn new(config: CameraConfig, fallback: Coordinate) -> Arc<Self> {
        let state = CameraState {
            target: CameraTarget::FollowingUser,
            viewport: Viewport::new(fallback, config.follow_span_deg),
            user_marker: None,
        };
        let (camera, _) = watch::channel(state.clone());
        Arc::new(Self {
            config,
            fallback,
            inner: Mutex::new(Inner {
                state,
                last_follow: None,
            }),
            camera,
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.camera.send_replace(inner.state.clone());
    }

    /// Feeds one published position. Returns the new viewport if the camera moved.
    pub fn on_position(&self, position: Position) -> Option<Viewport> {
        let mut inner = self.inner();
        inner.state.user_marker = Some(position);

        let moved = if inner.state.target == CameraTarget::FollowingUser {
            let coordinate = position.coordinate();
            let due = match inner.last_follow {
                None => true,
                Some((followed, at)) => {
                    let distance = followed.distance_to(&coordinate);
                    let far_enough = distance > self.config.follow_distance_m;
                    let waited = at.elapsed() >= self.config.throttle_window();
                    if !(far_enough && waited) {
                        debug!(
                            "Camera holding: moved {:.0}m, throttled: {}",
                            distance, !waited
                        );
                    }
                    far_enough && waited
                }
            };
            if due {
                let viewport = Viewport::new(coordinate, self.config.follow_span_deg);
                inner.state.viewport = viewport;
                inner.last_follow = Some((coordinate, Instant::now()));
                Some(viewport)
            } else {
                None
            }
        } else {
            None
        };

        self.publish(&inner);
        moved
    }

    /// Centers on a recommended place. Always wins.
    pub fn select_destination(&self, coordinate: Coordinate, name: impl Into<String>) -> Viewport {
        let name = name.into();
        info!("Camera showing destination {}", name);
        let mut inner = self.inner();
        let viewport = Viewport::new(coordinate, self.config.destination_span_deg);
        inner.state.target = CameraTarget::ShowingDestination { coordinate, name };
        inner.state.viewport = viewport;
        self.publish(&inner);
        viewport
    }

    /// Drops the destination and recenters on the last known position without
    /// waiting for a new reading. No-op if no destination is shown.
    pub fn clear_destination(&self) -> Option<Viewport> {
        let mut inner = self.inner();
        if !matches!(inner.state.target, CameraTarget::ShowingDestination { .. }) {
            return None;
        }
        info!("Camera destination cleared, following user");
        Some(self.follow_now(&mut inner))
    }

    /// A user pan or zoom. Suspends following until [`recenter`](Self::recenter).
    /// While a destination is shown the gesture moves the map but the
    /// destination stays in charge.
    pub fn manual_gesture(&self, viewport: Viewport) {
        let mut inner = self.inner();
        inner.state.viewport = viewport;
        if inner.state.target == CameraTarget::FollowingUser {
            debug!("Manual gesture, suspending camera follow");
            inner.state.target = CameraTarget::ManualOverride;
        }
        self.publish(&inner);
    }

    /// Returns control to following and recenters immediately, bypassing the
    /// throttle. Does nothing while a destination is shown; clear it first.
    pub fn recenter(&self) -> Option<Viewport> {
        let mut inner = self.inner();
        if matches!(inner.state.target, CameraTarget::ShowingDestination { .. }) {
            debug!("Recenter ignored, a destination is shown");
            return None;
        }
        Some(self.follow_now(&mut inner))
    }

    /// Centers on a position that was just acquired on purpose, bypassing the
    /// follow gates. Only the marker moves unless the camera is following.
    pub fn follow_at(&self, position: Position) -> Option<Viewport> {
        let mut inner = self.inner();
        inner.state.user_marker = Some(position);
        if inner.state.target != CameraTarget::FollowingUser {
            self.publish(&inner);
            return None;
        }
        Some(self.follow_now(&mut inner))
    }

    fn follow_now(&self, inner: &mut Inner) -> Viewport {
        let center = inner
            .state
            .user_marker
            .map(|p| p.coordinate())
            .unwrap_or(self.fallback);
        let viewport = Viewport::new(center, self.config.follow_span_deg);
        inner.state.target = CameraTarget::FollowingUser;
        inner.state.viewport = viewport;
        inner.last_follow = Some((center, Instant::now()));
        self.publish(inner);
        viewport
    }

    pub fn state(&self) -> CameraState {
        self.inner().state.clone()
    }

    pub fn target(&self) -> CameraTarget {
        self.inner().state.target.clone()
    }

    pub fn viewport(&self) -> Viewport {
        self.inner().state.viewport
    }

    pub fn subscribe(&self) -> watch::Receiver<CameraState> {
        self.camera.subscribe()
    }

    /// Applies every published position to the camera.
    pub fn follow(self: &Arc<Self>, mut positions: broadcast::Receiver<Position>) -> JoinHandle<()> {
        let camera = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match positions.recv().await {
                    Ok(position) => {
                        camera.on_position(position);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Camera skipped {} positions", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn at(lat: f64, lon: f64) -> Position {
        Position::new(lat, lon, Utc::now(), 5.0)
    }

    fn camera() -> Arc<CameraController> {
        CameraController::new(CameraConfig::default(), Coordinate::CAMPUS)
    }

    // 0.001° of latitude is ~111m.
    const STEP: f64 = 0.001;

    #[tokio::test(start_paused = true)]
    async fn first_position_moves_camera_off_the_fallback() {
        let camera = camera();
        assert_eq!(camera.viewport().center, Coordinate::CAMPUS);

        let moved = camera.on_position(at(40.70, -73.99)).unwrap();
        assert_eq!(moved.center, Coordinate::new(40.70, -73.99));
    }

    #[tokio::test(start_paused = true)]
    async fn follow_needs_both_distance_and_throttle() {
        let camera = camera();
        camera.on_position(at(40.70, -73.99));

        // Far enough, but inside the throttle window.
        assert!(camera.on_position(at(40.70 + STEP, -73.99)).is_none());

        tokio::time::advance(Duration::from_secs(3)).await;
        // Throttle passed, but only ~67m from the followed center.
        assert!(camera.on_position(at(40.70 + 0.0006, -73.99)).is_none());
        // Both gates open.
        assert!(camera.on_position(at(40.70 + 2.0 * STEP, -73.99)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn destination_blocks_follow_until_cleared() {
        let camera = camera();
        camera.on_position(at(40.70, -73.99));

        let dest = Coordinate::new(40.7295, -73.9965);
        camera.select_destination(dest, "Washington Square Park");
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(camera.on_position(at(40.71, -73.99)).is_none());
        assert_eq!(camera.viewport().center, dest);
        // The marker still tracks the user.
        assert_eq!(camera.state().user_marker.unwrap().latitude, 40.71);

        let back = camera.clear_destination().unwrap();
        assert_eq!(back.center, Coordinate::new(40.71, -73.99));
        assert_eq!(camera.target(), CameraTarget::FollowingUser);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_gesture_survives_position_updates_until_recenter() {
        let camera = camera();
        camera.on_position(at(40.70, -73.99));

        let panned = Viewport::new(Coordinate::new(40.75, -73.98), 0.05);
        camera.manual_gesture(panned);
        assert_eq!(camera.target(), CameraTarget::ManualOverride);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(camera.on_position(at(40.72, -73.99)).is_none());
        assert_eq!(camera.viewport(), panned);

        let recentered = camera.recenter().unwrap();
        assert_eq!(recentered.center, Coordinate::new(40.72, -73.99));
        assert_eq!(camera.target(), CameraTarget::FollowingUser);
    }

    #[tokio::test(start_paused = true)]
    async fn recenter_does_not_dismiss_a_destination() {
        let camera = camera();
        camera.select_destination(Coordinate::new(40.73, -73.99), "Bobst Library");

        assert!(camera.recenter().is_none());
        assert!(matches!(camera.target(), CameraTarget::ShowingDestination { .. }));
        assert!(camera.clear_destination().is_some());
        assert!(camera.clear_destination().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acquired_position_never_overrides_a_pan() {
        let camera = camera();
        camera.on_position(at(40.70, -73.99));
        let panned = Viewport::new(Coordinate::new(40.75, -73.98), 0.05);
        camera.manual_gesture(panned);

        assert!(camera.follow_at(at(40.71, -73.99)).is_none());
        assert_eq!(camera.viewport(), panned);

        camera.recenter();
        let moved = camera.follow_at(at(40.7101, -73.99)).unwrap();
        assert_eq!(moved.center.latitude, 40.7101);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_without_any_position_falls_back_to_default() {
        let camera = camera();
        camera.select_destination(Coordinate::new(40.73, -73.99), "Bobst Library");
        let back = camera.clear_destination().unwrap();
        assert_eq!(back.center, Coordinate::CAMPUS);
    }
}
