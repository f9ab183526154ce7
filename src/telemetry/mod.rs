//! Tracing subscriber setup for binaries embedding the core.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the host process.

// ── Submodules ────────────────────────────────────────────────────────────────

/// Telemetry configuration.
pub mod config;

/// Global subscriber initialisation.
pub mod subscriber;

// ── Re-exports ────────────────────────────────────────────────────────────────

pub use config::TelemetryConfig;
pub use subscriber::{TelemetryGuard, init_telemetry, telemetry_installed};
