//! Row types for the local store.
//!
//! Column layouts are load-bearing: readings are exported and graphed by
//! external tooling, so changes here require a migration. Temperatures are
//! stored in both scales with Celsius authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Singleton settings row (id = 1). Seeded from the environment on first
/// boot; the settings API is the sole writer afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettingsRow {
    pub id: i64,
    pub units: String,
    pub setpoint_c: f64,
    pub setpoint_f: f64,
    pub control_mode: String,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub min_on_s: i64,
    pub min_off_s: i64,
    pub hyst_c: f64,
    pub time_window_s: i64,
    pub hi_alarm_c: f64,
    pub lo_alarm_c: f64,
    pub stuck_high_rate_c_per_min: f64,
    pub stuck_high_duration_s: i64,
    pub sim_mode: bool,
    pub gpio_pin: i64,
    pub relay_active_high: bool,
    pub boost_duration_s: i64,
    pub adaptive_pid_enabled: bool,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Thermocouple channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Thermocouple {
    pub id: i64,
    pub name: String,
    pub cs_pin: i64,
    pub enabled: bool,
    pub is_control: bool,
    #[sqlx(rename = "order")]
    pub display_order: i64,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cooking session. At most one row has `is_active = true`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Smoke {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub recipe_id: Option<i64>,
    pub recipe_config: Option<String>,
    pub current_phase_id: Option<i64>,
    pub meat_target_temp_f: Option<f64>,
    pub meat_probe_tc_id: Option<i64>,
    pub pending_phase_transition: bool,
    pub total_duration_minutes: Option<i64>,
    pub avg_temp_f: Option<f64>,
    pub min_temp_f: Option<f64>,
    pub max_temp_f: Option<f64>,
}

/// Recipe template. Phases are snapshotted into `smokephase` rows when a
/// session is created from the recipe.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CookingRecipe {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// JSON array of phase templates.
    pub phases: String,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One phase of a cooking session. At most one row per smoke has
/// `is_active = true`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SmokePhase {
    pub id: i64,
    pub smoke_id: i64,
    pub phase_name: String,
    pub phase_order: i64,
    pub target_temp_f: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_paused: bool,
    /// JSON bag, see `phases::CompletionConditions`.
    pub completion_conditions: String,
    pub actual_duration_minutes: Option<i64>,
}

/// Control-loop sample appended once per tick.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reading {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub smoke_id: Option<i64>,
    pub temp_c: f64,
    pub temp_f: f64,
    pub setpoint_c: f64,
    pub setpoint_f: f64,
    pub output_bool: bool,
    pub relay_state: bool,
    pub loop_ms: i64,
    pub pid_output: f64,
    pub boost_active: bool,
}

/// Fields for a new control-loop sample.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub ts: DateTime<Utc>,
    pub smoke_id: Option<i64>,
    pub temp_c: f64,
    pub temp_f: f64,
    pub setpoint_c: f64,
    pub setpoint_f: f64,
    pub output_bool: bool,
    pub relay_state: bool,
    pub loop_ms: i64,
    pub pid_output: f64,
    pub boost_active: bool,
}

/// Per-channel sample attached to a `Reading`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ThermocoupleReading {
    pub id: i64,
    pub reading_id: i64,
    pub thermocouple_id: i64,
    pub temp_c: f64,
    pub temp_f: f64,
    pub fault: bool,
}

/// Fields for a new per-channel sample.
#[derive(Debug, Clone)]
pub struct NewThermocoupleReading {
    pub thermocouple_id: i64,
    pub temp_c: f64,
    pub temp_f: f64,
    pub fault: bool,
}

/// Persisted alert row. Invariant: at most one active row per `alert_type`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Alert {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    pub active: bool,
    pub acknowledged: bool,
    pub cleared_ts: Option<DateTime<Utc>>,
    pub meta_data: Option<String>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub meta_json: Option<String>,
}
