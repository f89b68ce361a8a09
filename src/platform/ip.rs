//! IP geolocation as a location receiver.
//!
//! Desktop builds have no GPS, so this receiver asks
//! [IpApi](https://ip-api.com/) where the machine's public address is and
//! reports that as a coarse reading. Continuous updates re-query on a fixed
//! interval; the movement filter in `PositionSource` discards the repeats.

use super::{LocationHardware, LocationReceiver, PlatformEvent, ReadingSink};
use crate::error::LocationError;
use crate::models::Position;
use chrono::Utc;
use ipgeolocate::{Locator, Service};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// ip-api places you somewhere in your ISP's city; call it 5 km.
const IP_ACCURACY_M: f64 = 5_000.0;

pub struct IpApiHardware {
    ip: String,
    poll_interval: Duration,
}

impl IpApiHardware {
    /// An empty `ip` asks the service to locate the caller's own address.
    pub fn new(ip: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            ip: ip.into(),
            poll_interval,
        }
    }
}

impl LocationHardware for IpApiHardware {
    fn open(&self, sink: ReadingSink) -> Result<Box<dyn LocationReceiver>, LocationError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| LocationError::HardwareUnavailable(e.to_string()))?;
        Ok(Box::new(IpApiReceiver {
            ip: self.ip.clone(),
            poll_interval: self.poll_interval,
            sink,
            handle,
            updates: None,
        }))
    }
}

struct IpApiReceiver {
    ip: String,
    poll_interval: Duration,
    sink: ReadingSink,
    handle: tokio::runtime::Handle,
    updates: Option<JoinHandle<()>>,
}

impl LocationReceiver for IpApiReceiver {
    fn start_updates(&mut self) -> Result<(), LocationError> {
        if self.updates.is_some() {
            return Ok(());
        }
        let ip = self.ip.clone();
        let sink = self.sink.clone();
        let interval = self.poll_interval;
        self.updates = Some(self.handle.spawn(async move {
            loop {
                if sink.send(lookup(&ip).await).is_err() {
                    break; // Source went away
                }
                tokio::time::sleep(interval).await;
            }
        }));
        info!("IP geolocation updates started ({}s interval)", interval.as_secs());
        Ok(())
    }

    fn stop_updates(&mut self) {
        if let Some(task) = self.updates.take() {
            task.abort();
        }
    }

    fn request_location(&mut self) -> Result<(), LocationError> {
        let ip = self.ip.clone();
        let sink = self.sink.clone();
        self.handle.spawn(async move {
            let _ = sink.send(lookup(&ip).await);
        });
        Ok(())
    }
}

impl Drop for IpApiReceiver {
    fn drop(&mut self) {
        self.stop_updates();
    }
}

async fn lookup(ip: &str) -> PlatformEvent {
    match Locator::get(ip, Service::IpApi).await {
        Ok(loc) => match (loc.latitude.parse::<f64>(), loc.longitude.parse::<f64>()) {
            (Ok(lat), Ok(lon)) => {
                info!("Geolocation successful - ({}, {})", lat, lon);
                PlatformEvent::Reading(Position::new(lat, lon, Utc::now(), IP_ACCURACY_M))
            }
            _ => {
                error!(
                    "Geolocation service returned unparsable coordinates ({}, {})",
                    loc.latitude, loc.longitude
                );
                PlatformEvent::Failure(LocationError::HardwareUnavailable(
                    "unparsable coordinates".to_string(),
                ))
            }
        },
        Err(e) => {
            error!("Error using geolocation service: {}", e);
            PlatformEvent::Failure(LocationError::HardwareUnavailable(e.to_string()))
        }
    }
}
