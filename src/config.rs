use crate::models::Coordinate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub location: LocationConfig,
    pub permission: PermissionConfig,
    pub acquisition: AcquisitionConfig,
    pub geocode: GeocodeConfig,
    pub camera: CameraConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    IpApi,     // IP geolocation via ip-api.com
    Simulated, // Scripted walk, no network
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LocationConfig {
    pub provider: ProviderKind,
    pub default_lat: f64,          // Fallback when nothing better is known
    pub default_lon: f64,
    pub movement_threshold_m: f64, // Readings closer than this are dropped
    pub ip_poll_interval_seconds: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PermissionConfig {
    pub safety_timeout_ms: u64,
    pub granted: bool, // Desktop stand-in for the OS prompt answer
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AcquisitionConfig {
    pub freshness_window_ms: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub default_timeout_ms: u64,
    pub initial_load_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GeocodeConfig {
    pub throttle_seconds: u64,
    pub endpoint: String,
    pub placeholder: String,
    pub request_timeout_seconds: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CameraConfig {
    pub follow_distance_m: f64,
    pub throttle_ms: u64,
    pub follow_span_deg: f64,
    pub destination_span_deg: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::IpApi,
            default_lat: Coordinate::CAMPUS.latitude,
            default_lon: Coordinate::CAMPUS.longitude,
            movement_threshold_m: 50.0,
            ip_poll_interval_seconds: 60,
        }
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            safety_timeout_ms: 5_000,
            granted: true,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: 5_000,
            poll_interval_ms: 1_000,
            max_attempts: 10,
            default_timeout_ms: 10_000,
            initial_load_timeout_ms: 10_000,
        }
    }
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            throttle_seconds: 5,
            endpoint: "https://nominatim.openstreetmap.org/reverse".to_string(),
            placeholder: "Current Location".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            follow_distance_m: 100.0,
            throttle_ms: 2_000,
            follow_span_deg: 0.01,
            destination_span_deg: 0.005,
        }
    }
}

impl LocationConfig {
    pub fn default_coordinate(&self) -> Coordinate {
        Coordinate::new(self.default_lat, self.default_lon)
    }
}

impl PermissionConfig {
    pub fn safety_timeout(&self) -> Duration {
        Duration::from_millis(self.safety_timeout_ms)
    }
}

impl AcquisitionConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    /// Zero is treated as unset; a timer can't tick with no period.
    pub fn poll_interval(&self) -> Duration {
        match self.poll_interval_ms {
            0 => Duration::from_millis(Self::default().poll_interval_ms),
            ms => Duration::from_millis(ms),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn initial_load_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_load_timeout_ms)
    }
}

impl GeocodeConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_seconds)
    }
}

impl CameraConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

impl Config {
    /// Loads config.toml from the working directory.
    /// If it doesn't exist (or doesn't parse), writes out the defaults.
    pub fn load() -> Self {
        Self::load_from("config.toml")
    }

    pub fn load_from(config_path: &str) -> Self {
        if let Ok(content) = fs::read_to_string(config_path) {
            match toml::from_str(&content) {
                Ok(config) => return config,
                Err(e) => warn!("Failed to parse {}: {}. Using defaults.", config_path, e),
            }
        }

        let default_config = Config::default();

        // Save default config to disk for the user to edit later
        match toml::to_string_pretty(&default_config) {
            Ok(toml_string) => {
                if fs::write(config_path, toml_string).is_err() {
                    warn!("Could not write default {} to disk.", config_path);
                }
            }
            Err(e) => warn!("Could not serialize default config: {}", e),
        }

        info!("Loaded default configuration.");
        default_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let c = Config::default();
        assert_eq!(c.location.movement_threshold_m, 50.0);
        assert_eq!(c.camera.follow_distance_m, 100.0);
        assert_eq!(c.permission.safety_timeout(), Duration::from_secs(5));
        assert_eq!(c.acquisition.poll_interval(), Duration::from_secs(1));
        assert_eq!(c.acquisition.max_attempts, 10);
        assert_eq!(c.geocode.throttle_window(), Duration::from_secs(5));
        assert_eq!(c.location.default_coordinate(), Coordinate::CAMPUS);
    }

    #[test]
    fn zero_poll_interval_falls_back_to_the_default() {
        let config: Config = toml::from_str(
            &toml::to_string_pretty(&Config::default())
                .unwrap()
                .replace("poll_interval_ms = 1000", "poll_interval_ms = 0"),
        )
        .unwrap();
        assert_eq!(config.acquisition.poll_interval_ms, 0);
        assert_eq!(config.acquisition.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_file_is_rejected_and_full_file_round_trips() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.location.provider, ProviderKind::IpApi);
        assert_eq!(parsed.geocode.placeholder, "Current Location");

        assert!(toml::from_str::<Config>("[location]\nprovider = \"simulated\"\n").is_err());
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("vantage-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "not = [valid").unwrap();

        let config = Config::load_from(path.to_str().unwrap());
        assert_eq!(config.acquisition.default_timeout_ms, 10_000);

        // The broken file was replaced by the defaults.
        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("movement_threshold_m"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
