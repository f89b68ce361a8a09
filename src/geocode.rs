//! Throttled reverse geocoding for the address badge.
//!
//! Every call to [`GeocodeThrottle::resolve`] bumps a generation counter. A
//! call only reaches the geocoder once the throttle window since the previous
//! lookup has passed, and it gives up (returning a stale result) as soon as a
//! newer generation exists, whether it is still waiting for the window or
//! already in flight. Only the newest generation may update the displayed
//! address, so a slow lookup for an old position can never overwrite a newer
//! one.

use crate::error::LocationError;
use crate::models::{GeocodeResult, Position};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<String, LocationError>;
}

#[derive(Default)]
struct ThrottleState {
    last_issued: Option<Instant>,
    calls_issued: usize,
}

pub struct GeocodeThrottle {
    geocoder: Arc<dyn ReverseGeocoder>,
    window: Duration,
    placeholder: String,
    state: Mutex<ThrottleState>,
    generation: watch::Sender<u64>,
    display: watch::Sender<Option<GeocodeResult>>,
}

impl GeocodeThrottle {
    pub fn new(
        geocoder: Arc<dyn ReverseGeocoder>,
        window: Duration,
        placeholder: impl Into<String>,
    ) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        let (display, _) = watch::channel(None);
        Arc::new(Self {
            geocoder,
            window,
            placeholder: placeholder.into(),
            state: Mutex::new(ThrottleState::default()),
            generation,
            display,
        })
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up the address for `position`, waiting out the throttle window if
    /// needed. Never fails: errors come back as a fresh result with no address.
    pub async fn resolve(&self, position: Position) -> GeocodeResult {
        let mut generation = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            generation = *g;
        });
        let mut newer = self.generation.subscribe();

        loop {
            let wait = self.remaining_window();
            if !wait.is_zero() {
                debug!("Geocode {} waiting {:?} for the throttle window", generation, wait);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = superseded(&mut newer, generation) => {
                        return GeocodeResult::stale(position);
                    }
                }
            }
            if self.claim_slot(generation) {
                break;
            }
            if self.current_generation() != generation {
                return GeocodeResult::stale(position);
            }
        }

        let lookup = tokio::select! {
            lookup = self.geocoder.reverse_geocode(position.latitude, position.longitude) => lookup,
            _ = superseded(&mut newer, generation) => {
                debug!("Geocode {} cancelled by a newer position", generation);
                return GeocodeResult::stale(position);
            }
        };
        // A newer call may have started while this one was finishing.
        if self.current_generation() != generation {
            return GeocodeResult::stale(position);
        }

        let result = match lookup {
            Ok(address) => GeocodeResult::fresh(Some(address), position),
            Err(e) => {
                warn!("Reverse geocoding failed, showing placeholder: {}", e);
                GeocodeResult::fresh(None, position)
            }
        };
        self.display.send_replace(Some(result.clone()));
        result
    }

    fn remaining_window(&self) -> Duration {
        match self.state().last_issued {
            Some(issued) => (issued + self.window).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Records a lookup for `generation` if it is still newest and the window
    /// has passed.
    fn claim_slot(&self, generation: u64) -> bool {
        let mut state = self.state();
        if self.current_generation() != generation {
            return false;
        }
        let now = Instant::now();
        if let Some(issued) = state.last_issued {
            if now.duration_since(issued) < self.window {
                return false;
            }
        }
        state.last_issued = Some(now);
        state.calls_issued += 1;
        true
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn calls_issued(&self) -> usize {
        self.state().calls_issued
    }

    /// The address to show right now: the newest lookup, or the placeholder.
    pub fn current_address(&self) -> String {
        self.display
            .borrow()
            .as_ref()
            .and_then(|r| r.address.clone())
            .unwrap_or_else(|| self.placeholder.clone())
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<GeocodeResult>> {
        self.display.subscribe()
    }

    /// Geocodes every published position. Each one runs on its own task so a
    /// newer position can cancel the lookup for an older one.
    pub fn follow(self: &Arc<Self>, mut positions: broadcast::Receiver<Position>) -> JoinHandle<()> {
        let throttle = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match positions.recv().await {
                    Ok(position) => {
                        let throttle = Arc::clone(&throttle);
                        tokio::spawn(async move {
                            throttle.resolve(position).await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Geocoder skipped {} positions", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Completes once the generation moves past `generation`.
async fn superseded(newer: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        if *newer.borrow_and_update() != generation {
            return;
        }
        if newer.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct Fixed(Result<String, LocationError>);

    #[async_trait]
    impl ReverseGeocoder for Fixed {
        async fn reverse_geocode(&self, _lat: f64, _lon: f64) -> Result<String, LocationError> {
            self.0.clone()
        }
    }

    fn position() -> Position {
        Position::new(40.6944, -73.9865, Utc::now(), 10.0)
    }

    #[tokio::test(start_paused = true)]
    async fn first_lookup_is_immediate() {
        let throttle = GeocodeThrottle::new(
            Arc::new(Fixed(Ok("6 MetroTech Center Brooklyn".into()))),
            Duration::from_secs(5),
            "Current Location",
        );
        let started = Instant::now();
        let result = throttle.resolve(position()).await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!result.is_stale);
        assert_eq!(throttle.current_address(), "6 MetroTech Center Brooklyn");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_degrades_to_placeholder() {
        let throttle = GeocodeThrottle::new(
            Arc::new(Fixed(Err(LocationError::GeocodeFailure("rate limited".into())))),
            Duration::from_secs(5),
            "Current Location",
        );
        let result = throttle.resolve(position()).await;

        assert_eq!(result.address, None);
        assert!(!result.is_stale);
        assert_eq!(throttle.current_address(), "Current Location");
    }

    #[tokio::test(start_paused = true)]
    async fn second_lookup_waits_out_the_window() {
        let throttle = GeocodeThrottle::new(
            Arc::new(Fixed(Ok("Jay St".into()))),
            Duration::from_secs(5),
            "Current Location",
        );
        throttle.resolve(position()).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let started = Instant::now();
        throttle.resolve(position()).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_millis(3_100));
        assert_eq!(throttle.calls_issued(), 2);
    }
}
