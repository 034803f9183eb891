//! # Pit Controller Daemon Library
//!
//! Real-time temperature control for offset and pellet smokers. A
//! single-board computer reads K-type thermocouples through SPI converter
//! chips, drives the heating element through a relay, and holds the pit at
//! the selected setpoint across cooks lasting many hours.
//!
//! ## Architecture
//!
//! The daemon is organized into several layers:
//!
//! - **hardware**: sensor and relay access with simulator fallback, plus the
//!   per-channel filtering pipeline
//! - **control**: PID, auto-tuner, adaptive tuner, and the relay-intent
//!   strategies
//! - **db**: repository layer over the single-file local store
//! - **phases**: cooking phase state machine and stall detection
//! - **session**: binding of the active cook to the control loop
//! - **alerts**: debounced alert checks and webhook notifications
//! - **telemetry**: 1 Hz snapshot broadcast to observers
//! - **comms**: the WebSocket/health surface
//!
//! ## Timing
//!
//! Two periodic bodies run on the cooperative runtime:
//!
//! - Monitoring: 1 Hz sensor sweep, always on from boot
//! - Control: 1 Hz tick while the controller is started; each tick runs
//!   read → decide → actuate → log → alert and sleeps the remainder
//!
//! Telemetry broadcasts once per second to every subscriber.
//!
//! ## Hardware Platform
//!
//! - Raspberry Pi (or compatible SBC) with SPI enabled
//! - MAX31855 thermocouple converters, one chip-select GPIO each
//! - A relay or SSR on a GPIO output driving the heating element
//!
//! With `sim_mode` enabled, or whenever device acquisition fails, simulated
//! hardware stands in so the control stack keeps operating.

use std::time::Duration;

// Public module declarations
pub mod alerts;
pub mod comms;
pub mod control;
pub mod controller;
pub mod db;
pub mod hardware;
pub mod phases;
pub mod session;
pub mod telemetry;

// Module-level Constants

/// Control and monitoring cadence.
pub const LOOP_INTERVAL: Duration = Duration::from_secs(1);

/// Daemon version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Error Type Definitions

/// Daemon-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Hardware error: {0}")]
    Hardware(#[from] hardware::ProbeError),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] config_types::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Public Re-exports

pub use alerts::{AlertEngine, AlertInput, AlertThresholds};
pub use controller::{ControlSettings, Controller, Diagnostics};
pub use db::Store;
pub use hardware::{RelayDriver, SensorManager};
pub use phases::PhaseManager;
pub use session::SessionCoordinator;
pub use telemetry::TelemetryPublisher;
