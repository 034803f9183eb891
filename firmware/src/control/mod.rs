//! # Control Laws
//!
//! Everything that decides what the relay should do.
//!
//! ## Module Organization
//!
//! - **pid**: discrete PID with anti-windup and bumpless transfer
//! - **autotune**: relay-feedback auto-tuner (Åström–Hägglund)
//! - **adaptive**: continuous rolling-window gain trimming
//! - **strategy**: thermostat hysteresis/dwell and duty-window laws

pub mod adaptive;
pub mod autotune;
pub mod pid;
pub mod strategy;

pub use adaptive::{AdaptiveConfig, AdaptiveStatus, AdaptiveTuner, Adjustment};
pub use autotune::{AutoTuneConfig, AutoTuneState, AutoTuneStatus, AutoTuner, TuningRule};
pub use pid::{Pid, PidState};
pub use strategy::{thermostat_intent, DutyWindow, DwellGate};
