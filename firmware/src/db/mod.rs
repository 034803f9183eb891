//! # Persistence Gateway
//!
//! Thin repository layer over the single-file local store.
//!
//! ## Module Organization
//!
//! - **models**: row types mirroring the durable schema
//! - **store**: connection handling, schema application, repositories

pub mod models;
pub mod store;

pub use models::{
    Alert, CookingRecipe, Event, NewReading, NewThermocoupleReading, Reading, SettingsRow, Smoke,
    SmokePhase, Thermocouple, ThermocoupleReading,
};
pub use store::Store;
