//! # Configuration Type Definitions
//!
//! This library provides configuration types for the pit controller. They are
//! shared between the firmware daemon (which uses them to seed the settings
//! row and bind hardware) and auxiliary tooling.
//!
//! ## Configuration Architecture
//!
//! Configuration enters the system in two layers:
//! - **Environment**: process environment (optionally via a `.env` file),
//!   read once at startup. These values are defaults only.
//! - **Settings row**: the singleton `settings` row in the local store. It is
//!   seeded from the environment on first boot and is the single source of
//!   truth thereafter; the environment never overrides an existing row.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Heater control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Simple on/off switching around a hysteresis band.
    Thermostat,
    /// PID output duty-cycled over a fixed time window.
    TimeProportional,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Thermostat => "thermostat",
            ControlMode::TimeProportional => "time_proportional",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "thermostat" => Ok(ControlMode::Thermostat),
            "time_proportional" => Ok(ControlMode::TimeProportional),
            other => Err(ConfigError::InvalidValue {
                name: "control mode".into(),
                value: other.into(),
            }),
        }
    }
}

/// Temperature unit preference for display. Celsius is authoritative
/// internally regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    F,
    C,
}

impl Units {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_uppercase().as_str() {
            "F" => Ok(Units::F),
            "C" => Ok(Units::C),
            other => Err(ConfigError::InvalidValue {
                name: "units".into(),
                value: other.into(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Units::F => "F",
            Units::C => "C",
        }
    }
}

/// Converts Celsius to Fahrenheit.
pub fn celsius_to_fahrenheit(temp_c: f64) -> f64 {
    temp_c * 9.0 / 5.0 + 32.0
}

/// Converts Fahrenheit to Celsius.
pub fn fahrenheit_to_celsius(temp_f: f64) -> f64 {
    (temp_f - 32.0) * 5.0 / 9.0
}

/// Environment-sourced configuration.
///
/// Field defaults mirror the seeded settings row; see [`EnvConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Use simulators for sensors and relay.
    pub sim_mode: bool,

    /// BCM pin number driving the heater relay.
    pub gpio_pin: u8,

    /// Relay polarity (true = active-high).
    pub relay_active_high: bool,

    /// Location of the SQLite store.
    pub db_path: PathBuf,

    /// tracing filter directive (e.g. "info", "pitmaster_firmware=debug").
    pub log_level: String,

    /// Log to this file instead of stdout when set.
    pub log_file: Option<PathBuf>,

    /// Webhook target for alert notifications.
    pub webhook_url: Option<String>,

    /// CORS origins for the WebSocket/health surface.
    pub allowed_origins: Vec<String>,

    /// Display units preference.
    pub units: Units,

    /// Initial pit setpoint, interpreted in `units`.
    pub setpoint: f64,

    /// Initial control mode.
    pub control_mode: ControlMode,

    /// Initial PID gains.
    pub pid_kp: f64,
    pub pid_ki: f64,
    pub pid_kd: f64,

    /// Relay dwell and hysteresis defaults.
    pub min_on_s: i64,
    pub min_off_s: i64,
    pub hyst_c: f64,
    pub time_window_s: i64,

    /// Alarm thresholds (Celsius).
    pub hi_alarm_c: f64,
    pub lo_alarm_c: f64,
    pub stuck_high_rate_c_per_min: f64,
    pub stuck_high_duration_s: i64,

    /// Boost mode duration.
    pub boost_duration_s: i64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            sim_mode: false,
            gpio_pin: 17,
            relay_active_high: false,
            db_path: PathBuf::from("./pitmaster.db"),
            log_level: "info".to_string(),
            log_file: None,
            webhook_url: None,
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
            units: Units::F,
            setpoint: 225.0,
            control_mode: ControlMode::Thermostat,
            pid_kp: 4.0,
            pid_ki: 0.1,
            pid_kd: 20.0,
            min_on_s: 5,
            min_off_s: 5,
            hyst_c: 0.6,
            time_window_s: 10,
            hi_alarm_c: 135.0,
            lo_alarm_c: 65.6,
            stuck_high_rate_c_per_min: 2.0,
            stuck_high_duration_s: 60,
            boost_duration_s: 60,
        }
    }
}

impl EnvConfig {
    /// Loads configuration from the process environment, reading a `.env`
    /// file first when present. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();

        if let Some(v) = read_var("SIM_MODE")? {
            cfg.sim_mode = parse_bool("SIM_MODE", &v)?;
        }
        if let Some(v) = read_var("GPIO_PIN")? {
            cfg.gpio_pin = parse_num("GPIO_PIN", &v)?;
        }
        if let Some(v) = read_var("RELAY_ACTIVE_HIGH")? {
            cfg.relay_active_high = parse_bool("RELAY_ACTIVE_HIGH", &v)?;
        }
        if let Some(v) = read_var("DB_PATH")? {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = read_var("LOG_LEVEL")? {
            cfg.log_level = v;
        }
        if let Some(v) = read_var("LOG_FILE")? {
            cfg.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = read_var("WEBHOOK_URL")? {
            cfg.webhook_url = Some(v);
        }
        if let Some(v) = read_var("ALLOWED_ORIGINS")? {
            cfg.allowed_origins = parse_origins(&v);
        }
        if let Some(v) = read_var("UNITS")? {
            cfg.units = Units::parse(&v)?;
        }
        if let Some(v) = read_var("SETPOINT")? {
            cfg.setpoint = parse_num("SETPOINT", &v)?;
        }
        if let Some(v) = read_var("CONTROL_MODE")? {
            cfg.control_mode = ControlMode::parse(&v)?;
        }
        if let Some(v) = read_var("PID_KP")? {
            cfg.pid_kp = parse_num("PID_KP", &v)?;
        }
        if let Some(v) = read_var("PID_KI")? {
            cfg.pid_ki = parse_num("PID_KI", &v)?;
        }
        if let Some(v) = read_var("PID_KD")? {
            cfg.pid_kd = parse_num("PID_KD", &v)?;
        }
        if let Some(v) = read_var("MIN_ON_S")? {
            cfg.min_on_s = parse_num("MIN_ON_S", &v)?;
        }
        if let Some(v) = read_var("MIN_OFF_S")? {
            cfg.min_off_s = parse_num("MIN_OFF_S", &v)?;
        }
        if let Some(v) = read_var("HYST_C")? {
            cfg.hyst_c = parse_num("HYST_C", &v)?;
        }
        if let Some(v) = read_var("TIME_WINDOW_S")? {
            cfg.time_window_s = parse_num("TIME_WINDOW_S", &v)?;
        }
        if let Some(v) = read_var("HI_ALARM_C")? {
            cfg.hi_alarm_c = parse_num("HI_ALARM_C", &v)?;
        }
        if let Some(v) = read_var("LO_ALARM_C")? {
            cfg.lo_alarm_c = parse_num("LO_ALARM_C", &v)?;
        }
        if let Some(v) = read_var("STUCK_HIGH_RATE_C_PER_MIN")? {
            cfg.stuck_high_rate_c_per_min = parse_num("STUCK_HIGH_RATE_C_PER_MIN", &v)?;
        }
        if let Some(v) = read_var("STUCK_HIGH_DURATION_S")? {
            cfg.stuck_high_duration_s = parse_num("STUCK_HIGH_DURATION_S", &v)?;
        }
        if let Some(v) = read_var("BOOST_DURATION_S")? {
            cfg.boost_duration_s = parse_num("BOOST_DURATION_S", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates that configuration values are physically reasonable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pid_kp < 0.0 || self.pid_ki < 0.0 || self.pid_kd < 0.0 {
            return Err(ConfigError::InvalidConfiguration(
                "PID gains must be non-negative".to_string(),
            ));
        }

        if self.min_on_s < 0 || self.min_off_s < 0 {
            return Err(ConfigError::InvalidConfiguration(
                "relay dwell times must be non-negative".to_string(),
            ));
        }

        if self.hyst_c < 0.0 {
            return Err(ConfigError::InvalidConfiguration(
                "hysteresis must be non-negative".to_string(),
            ));
        }

        if self.time_window_s <= 0 {
            return Err(ConfigError::InvalidConfiguration(
                "time window must be positive".to_string(),
            ));
        }

        if self.lo_alarm_c >= self.hi_alarm_c {
            return Err(ConfigError::InvalidConfiguration(format!(
                "low alarm {} must be below high alarm {}",
                self.lo_alarm_c, self.hi_alarm_c
            )));
        }

        Ok(())
    }

    /// The initial setpoint in Celsius, whatever the display units.
    pub fn setpoint_celsius(&self) -> f64 {
        match self.units {
            Units::F => fahrenheit_to_celsius(self.setpoint),
            Units::C => self.setpoint,
        }
    }

    /// The initial setpoint in Fahrenheit.
    pub fn setpoint_fahrenheit(&self) -> f64 {
        match self.units {
            Units::F => self.setpoint,
            Units::C => celsius_to_fahrenheit(self.setpoint),
        }
    }
}

fn read_var(name: &str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_string())),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            name: name.into(),
            value: "<non-unicode>".into(),
        }),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.into(),
            value: value.into(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: name.into(),
        value: value.into(),
    })
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
