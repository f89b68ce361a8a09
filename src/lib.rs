//! Location acquisition for a campus map: permission handling, filtered
//! position updates, bounded one-shot acquisition, throttled reverse
//! geocoding and a prioritized map camera.
//!
//! [`subsystem::LocationSubsystem`] wires the pieces together; the platform
//! seams live in [`platform`].

pub mod acquisition;
pub mod api;
pub mod app;
pub mod camera;
pub mod config;
pub mod error;
pub mod events;
pub mod geocode;
pub mod logging;
pub mod models;
pub mod permission;
pub mod platform;
pub mod source;
pub mod subsystem;
