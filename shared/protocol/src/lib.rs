//! # Pit Controller Wire Protocol
//!
//! This library defines the messages exchanged between the controller daemon
//! and its observers. It provides the telemetry frame broadcast to WebSocket
//! subscribers, the small client/server message vocabulary, and the webhook
//! payloads sent on alert activation.
//!
//! ## Message Flow
//!
//! ```text
//! Daemon → Subscribers:
//!   - TelemetryFrame (1 Hz snapshot of loop state + alerts + phase)
//!   - Pong (reply to client Ping)
//!   - PhaseEvent (phase_transition_ready edge)
//!
//! Daemon → Webhook target:
//!   - Generic JSON payload, or a Discord embed when the URL is a Discord
//!     webhook endpoint
//! ```
//!
//! All messages use JSON serialization. Temperatures appear in both scales;
//! Celsius is authoritative. Timestamps are UTC, rendered ISO-8601.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Shared Enumerations

/// Alert severity level, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Discord embed color for this severity.
    pub fn discord_color(&self) -> u32 {
        match self {
            Severity::Critical => 15158332,
            Severity::Error => 15105570,
            Severity::Warning => 16776960,
            Severity::Info => 3447003,
        }
    }
}

/// The alert conditions the engine evaluates. One active row per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighTemp,
    LowTemp,
    StuckHigh,
    SensorFault,
    HardwareFallback,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighTemp => "high_temp",
            AlertKind::LowTemp => "low_temp",
            AlertKind::StuckHigh => "stuck_high",
            AlertKind::SensorFault => "sensor_fault",
            AlertKind::HardwareFallback => "hardware_fallback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high_temp" => Some(AlertKind::HighTemp),
            "low_temp" => Some(AlertKind::LowTemp),
            "stuck_high" => Some(AlertKind::StuckHigh),
            "sensor_fault" => Some(AlertKind::SensorFault),
            "hardware_fallback" => Some(AlertKind::HardwareFallback),
            _ => None,
        }
    }

    /// Title used in notification headers ("High Temp" etc.).
    pub fn title(&self) -> &'static str {
        match self {
            AlertKind::HighTemp => "High Temperature",
            AlertKind::LowTemp => "Low Temperature",
            AlertKind::StuckHigh => "Stuck High",
            AlertKind::SensorFault => "Sensor Fault",
            AlertKind::HardwareFallback => "Hardware Fallback",
        }
    }

    /// Emoji prefix for Discord embed titles.
    pub fn emoji(&self) -> &'static str {
        match self {
            AlertKind::HighTemp => "\u{1F525}",         // fire
            AlertKind::LowTemp => "\u{2744}\u{FE0F}",   // snowflake
            AlertKind::StuckHigh => "\u{26A0}\u{FE0F}", // warning
            AlertKind::SensorFault => "\u{1F6A8}",      // rotating light
            AlertKind::HardwareFallback => "\u{1F50C}", // plug
        }
    }
}

// Telemetry Messages (Daemon → Subscribers)

/// Top-level telemetry frame broadcast once per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: TelemetryData,
}

impl TelemetryFrame {
    pub fn new(timestamp: DateTime<Utc>, data: TelemetryData) -> Self {
        Self {
            timestamp,
            kind: "telemetry".to_string(),
            data,
        }
    }
}

/// Snapshot of the control loop and alert state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryData {
    /// Active control is running (relay may switch).
    pub running: bool,

    pub boost_active: bool,
    pub boost_until: Option<DateTime<Utc>>,

    /// "thermostat" or "time_proportional".
    pub control_mode: String,

    pub active_smoke_id: Option<i64>,

    pub current_temp_c: Option<f64>,
    pub current_temp_f: Option<f64>,
    pub setpoint_c: f64,
    pub setpoint_f: f64,

    /// Raw control-law output (0-100 %).
    pub pid_output: f64,

    /// Commanded relay intent vs. actual relay state.
    pub output_bool: bool,
    pub relay_state: bool,

    pub loop_count: u64,

    /// Last control tick duration in seconds.
    pub last_loop_time: Option<f64>,

    /// Per-channel readings keyed by thermocouple id (stringified).
    pub thermocouple_readings: BTreeMap<String, ChannelReading>,

    pub alert_summary: AlertSummary,
    pub alerts: Vec<AlertFrame>,

    pub current_phase: Option<PhaseSnapshot>,
    pub pending_phase_transition: bool,

    /// Advisory: meat temperature plateau detected.
    pub stall_detected: bool,
}

/// One thermocouple channel in the telemetry frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelReading {
    pub temp_c: f64,
    pub temp_f: f64,
    pub fault: bool,
    /// "real" or "simulated".
    pub mode: ChannelMode,
}

/// Whether a channel is backed by hardware or a simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Real,
    Simulated,
}

/// Aggregate counts over the currently active alerts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AlertSummary {
    pub count: usize,
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
    pub unacknowledged: usize,
}

/// One active alert as rendered into the telemetry frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertFrame {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub active: bool,
    pub acknowledged: bool,
    pub cleared_ts: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// Current cooking phase as rendered into the telemetry frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub id: i64,
    pub phase_name: String,
    pub phase_order: i64,
    pub target_temp_f: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_paused: bool,
    pub completion_conditions: serde_json::Value,
}

/// Out-of-band event published when a phase completes its conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub smoke_id: i64,
    pub reason: String,
    pub current_phase: Option<PhaseSnapshot>,
    pub next_phase: Option<PhaseSnapshot>,
}

impl PhaseEvent {
    pub fn transition_ready(
        timestamp: DateTime<Utc>,
        smoke_id: i64,
        reason: String,
        current_phase: Option<PhaseSnapshot>,
        next_phase: Option<PhaseSnapshot>,
    ) -> Self {
        Self {
            timestamp,
            kind: "phase_transition_ready".to_string(),
            smoke_id,
            reason,
            current_phase,
            next_phase,
        }
    }
}

// Client Messages (Subscriber → Daemon)

/// Messages a WebSocket subscriber may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
}

/// Reply to a client ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

impl Pong {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: "pong".to_string(),
            timestamp,
        }
    }
}

// Webhook Payloads (Daemon → External)

/// Generic alert webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub alert_id: i64,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Discord webhook body: a single embed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordWebhook {
    pub embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordEmbed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<DiscordField>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Returns true when the URL targets a Discord webhook endpoint, which
/// requires the embed schema instead of the generic body.
pub fn is_discord_webhook(url: &str) -> bool {
    url.contains("discord.com/api/webhooks")
}

/// Builds the Discord embed body for an alert.
///
/// Temperature and threshold fields are added in both scales when the alert
/// metadata carries `temp_c`/`threshold` values.
pub fn discord_payload(
    kind: AlertKind,
    severity: Severity,
    alert_id: i64,
    message: &str,
    timestamp: DateTime<Utc>,
    metadata: &serde_json::Value,
) -> DiscordWebhook {
    let mut fields = vec![
        DiscordField {
            name: "Severity".to_string(),
            value: severity.as_str().to_string(),
            inline: true,
        },
        DiscordField {
            name: "Alert ID".to_string(),
            value: alert_id.to_string(),
            inline: true,
        },
    ];

    if let Some(temp_c) = metadata.get("temp_c").and_then(|v| v.as_f64()) {
        fields.push(DiscordField {
            name: "Temperature".to_string(),
            value: format!("{:.1}\u{00B0}C / {:.1}\u{00B0}F", temp_c, c_to_f(temp_c)),
            inline: true,
        });
    }
    if let Some(threshold) = metadata.get("threshold").and_then(|v| v.as_f64()) {
        fields.push(DiscordField {
            name: "Threshold".to_string(),
            value: format!(
                "{:.1}\u{00B0}C / {:.1}\u{00B0}F",
                threshold,
                c_to_f(threshold)
            ),
            inline: true,
        });
    }

    DiscordWebhook {
        embeds: vec![DiscordEmbed {
            title: format!("{} {}", kind.emoji(), kind.title()),
            description: message.to_string(),
            color: severity.discord_color(),
            fields,
            timestamp,
        }],
    }
}

fn c_to_f(temp_c: f64) -> f64 {
    temp_c * 9.0 / 5.0 + 32.0
}

// Serialization Helpers

/// Serializes a telemetry frame to a JSON string.
pub fn serialize_frame(frame: &TelemetryFrame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Parses an incoming client message.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

// Error Type Definitions

/// Protocol-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_data() -> TelemetryData {
        TelemetryData {
            running: true,
            boost_active: false,
            boost_until: None,
            control_mode: "time_proportional".to_string(),
            active_smoke_id: Some(3),
            current_temp_c: Some(107.0),
            current_temp_f: Some(224.6),
            setpoint_c: 107.2,
            setpoint_f: 225.0,
            pid_output: 42.5,
            output_bool: true,
            relay_state: true,
            loop_count: 1200,
            last_loop_time: Some(0.012),
            thermocouple_readings: BTreeMap::new(),
            alert_summary: AlertSummary::default(),
            alerts: Vec::new(),
            current_phase: None,
            pending_phase_transition: false,
            stall_detected: false,
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        let frame = TelemetryFrame::new(ts, sample_data());

        let json = serialize_frame(&frame).unwrap();
        assert!(json.contains("\"type\":\"telemetry\""));

        let parsed: TelemetryFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data.loop_count, 1200);
        assert_eq!(parsed.data.control_mode, "time_proportional");
        assert_eq!(parsed.timestamp, ts);
    }

    #[test]
    fn test_ping_parsing() {
        let msg = parse_client_message(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message(r#"{"type":"launch"}"#).is_err());
    }

    #[test]
    fn test_severity_ordering_and_colors() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert_eq!(Severity::Critical.discord_color(), 15158332);
        assert_eq!(Severity::Info.discord_color(), 3447003);
    }

    #[test]
    fn test_alert_kind_round_trip() {
        for kind in [
            AlertKind::HighTemp,
            AlertKind::LowTemp,
            AlertKind::StuckHigh,
            AlertKind::SensorFault,
            AlertKind::HardwareFallback,
        ] {
            assert_eq!(AlertKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AlertKind::parse("thermal_runaway"), None);
    }

    #[test]
    fn test_discord_url_detection() {
        assert!(is_discord_webhook(
            "https://discord.com/api/webhooks/123/token"
        ));
        assert!(!is_discord_webhook("https://hooks.example.com/alert"));
    }

    #[test]
    fn test_discord_payload_fields() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        let meta = serde_json::json!({"temp_c": 140.0, "threshold": 135.0});

        let body = discord_payload(
            AlertKind::HighTemp,
            Severity::Error,
            7,
            "High temperature alert",
            ts,
            &meta,
        );

        let embed = &body.embeds[0];
        assert_eq!(embed.color, 15105570);
        assert!(embed.title.ends_with("High Temperature"));
        // Severity, Alert ID, Temperature, Threshold
        assert_eq!(embed.fields.len(), 4);
        assert!(embed.fields[2].value.contains("284.0"));
    }

    #[test]
    fn test_discord_payload_without_temps() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        let body = discord_payload(
            AlertKind::SensorFault,
            Severity::Critical,
            1,
            "Sensor fault",
            ts,
            &serde_json::Value::Null,
        );
        assert_eq!(body.embeds[0].fields.len(), 2);
    }
}
