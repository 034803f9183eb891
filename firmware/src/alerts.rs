//! Alert engine: debounced condition checks with rate-limited webhook
//! notifications.
//!
//! Runs once per control tick against the status snapshot. Alert rows are
//! persisted with at most one active row per alert type; webhook delivery is
//! fire-and-forget and never blocks the loop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use protocol::{AlertFrame, AlertKind, AlertSummary, Severity};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::db::Store;
use crate::ControllerError;

/// Threshold inputs for the per-tick checks, sourced from settings.
#[derive(Debug, Clone, Copy)]
pub struct AlertThresholds {
    pub hi_alarm_c: f64,
    pub lo_alarm_c: f64,
    pub stuck_high_rate_c_per_min: f64,
}

/// Per-tick snapshot the engine evaluates.
#[derive(Debug, Clone, Copy)]
pub struct AlertInput {
    pub temp_c: Option<f64>,
    pub relay_state: bool,
    pub sim_mode: bool,
    pub hardware_fallback: bool,
    pub thresholds: AlertThresholds,
}

/// A key may only go idle→active once per this interval.
const DEBOUNCE: Duration = Duration::from_secs(5);
/// Minimum spacing between webhook deliveries.
const WEBHOOK_RATE_LIMIT: Duration = Duration::from_secs(60);
/// Webhook POST timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
/// Temperature history span for stuck-high rate estimation.
const STUCK_HIGH_WINDOW: Duration = Duration::from_secs(120);
/// Rate is estimated over at most this many trailing samples.
const STUCK_HIGH_SAMPLES: usize = 10;

pub struct AlertEngine {
    store: Store,
    webhook_url: Option<String>,
    client: reqwest::Client,

    /// alert kind -> active row id
    active: HashMap<AlertKind, i64>,
    /// alert kind -> instant of last activation
    debounce: HashMap<AlertKind, Instant>,

    temp_history: VecDeque<(Instant, f64)>,
    last_webhook: Option<Instant>,
}

impl AlertEngine {
    pub fn new(store: Store, webhook_url: Option<String>) -> Self {
        Self {
            store,
            webhook_url,
            client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_default(),
            active: HashMap::new(),
            debounce: HashMap::new(),
            temp_history: VecDeque::new(),
            last_webhook: None,
        }
    }

    /// Re-adopts alert rows that were active when the process last exited,
    /// preserving one-active-row-per-type across restarts.
    pub async fn load_active(&mut self) -> Result<(), ControllerError> {
        for alert in self.store.active_alerts().await? {
            if let Some(kind) = AlertKind::parse(&alert.alert_type) {
                self.active.insert(kind, alert.id);
            }
        }
        if !self.active.is_empty() {
            info!("Adopted {} active alert(s) from the store", self.active.len());
        }
        Ok(())
    }

    pub fn set_webhook_url(&mut self, url: Option<String>) {
        self.webhook_url = url;
    }

    /// Runs every predicate against the snapshot. Each check has its own
    /// soft-failure boundary: a store error is logged and the remaining
    /// checks still run.
    pub async fn check_alerts(&mut self, input: &AlertInput, now: Instant) {
        if let Err(e) = self.check_high_temp(input, now).await {
            error!("high_temp check failed: {e}");
        }
        if let Err(e) = self.check_low_temp(input, now).await {
            error!("low_temp check failed: {e}");
        }
        if let Err(e) = self.check_stuck_high(input, now).await {
            error!("stuck_high check failed: {e}");
        }
        if let Err(e) = self.check_sensor_fault(input, now).await {
            error!("sensor_fault check failed: {e}");
        }
        if let Err(e) = self.check_hardware_fallback(input, now).await {
            error!("hardware_fallback check failed: {e}");
        }
    }

    async fn check_high_temp(
        &mut self,
        input: &AlertInput,
        now: Instant,
    ) -> Result<(), ControllerError> {
        let temp_c = match input.temp_c {
            Some(t) => t,
            None => return Ok(()),
        };
        let threshold = input.thresholds.hi_alarm_c;

        if temp_c >= threshold {
            self.activate(
                AlertKind::HighTemp,
                Severity::Error,
                format!(
                    "High temperature alert: {temp_c:.1}\u{00B0}C (threshold: {threshold:.1}\u{00B0}C)"
                ),
                json!({"temp_c": temp_c, "threshold": threshold}),
                now,
            )
            .await?;
        } else {
            self.clear(AlertKind::HighTemp, "Temperature returned to normal range")
                .await?;
        }
        Ok(())
    }

    async fn check_low_temp(
        &mut self,
        input: &AlertInput,
        now: Instant,
    ) -> Result<(), ControllerError> {
        let temp_c = match input.temp_c {
            Some(t) => t,
            None => return Ok(()),
        };
        let threshold = input.thresholds.lo_alarm_c;

        if temp_c <= threshold {
            self.activate(
                AlertKind::LowTemp,
                Severity::Warning,
                format!(
                    "Low temperature alert: {temp_c:.1}\u{00B0}C (threshold: {threshold:.1}\u{00B0}C)"
                ),
                json!({"temp_c": temp_c, "threshold": threshold}),
                now,
            )
            .await?;
        } else {
            self.clear(AlertKind::LowTemp, "Temperature returned to normal range")
                .await?;
        }
        Ok(())
    }

    /// Relay is off but the pit keeps heating: likely a welded relay or a
    /// runaway fire.
    async fn check_stuck_high(
        &mut self,
        input: &AlertInput,
        now: Instant,
    ) -> Result<(), ControllerError> {
        let temp_c = match input.temp_c {
            Some(t) => t,
            None => return Ok(()),
        };

        self.temp_history.push_back((now, temp_c));
        while self
            .temp_history
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) > STUCK_HIGH_WINDOW)
        {
            self.temp_history.pop_front();
        }

        if self.temp_history.len() < 2 {
            return Ok(());
        }

        let start = self.temp_history.len().saturating_sub(STUCK_HIGH_SAMPLES);
        let recent: Vec<(Instant, f64)> = self.temp_history.iter().skip(start).copied().collect();
        let (first_t, first) = recent[0];
        let (last_t, last) = recent[recent.len() - 1];
        let span_s = last_t.duration_since(first_t).as_secs_f64();
        if span_s <= 0.0 {
            return Ok(());
        }
        let rate_per_min = (last - first) / span_s * 60.0;

        let threshold = input.thresholds.stuck_high_rate_c_per_min;

        if !input.relay_state && rate_per_min > threshold {
            self.activate(
                AlertKind::StuckHigh,
                Severity::Error,
                format!(
                    "Stuck high temperature: {temp_c:.1}\u{00B0}C rising at {rate_per_min:.1}\u{00B0}C/min (relay off)"
                ),
                json!({"temp_c": temp_c, "rate": rate_per_min, "relay_state": input.relay_state}),
                now,
            )
            .await?;
        } else if rate_per_min <= threshold {
            self.clear(AlertKind::StuckHigh, "Temperature rate returned to normal")
                .await?;
        }
        Ok(())
    }

    async fn check_sensor_fault(
        &mut self,
        input: &AlertInput,
        now: Instant,
    ) -> Result<(), ControllerError> {
        if input.temp_c.is_none() {
            self.activate(
                AlertKind::SensorFault,
                Severity::Critical,
                "Temperature sensor fault - no reading available".to_string(),
                json!({"temp_c": null}),
                now,
            )
            .await?;
        } else {
            self.clear(AlertKind::SensorFault, "Sensor reading restored")
                .await?;
        }
        Ok(())
    }

    async fn check_hardware_fallback(
        &mut self,
        input: &AlertInput,
        now: Instant,
    ) -> Result<(), ControllerError> {
        if !input.sim_mode && input.hardware_fallback {
            self.activate(
                AlertKind::HardwareFallback,
                Severity::Warning,
                "Hardware not responding; one or more channels running on fallback simulation"
                    .to_string(),
                json!({"sim_mode": input.sim_mode}),
                now,
            )
            .await?;
        } else {
            self.clear(AlertKind::HardwareFallback, "All channels on real hardware")
                .await?;
        }
        Ok(())
    }

    async fn activate(
        &mut self,
        kind: AlertKind,
        severity: Severity,
        message: String,
        metadata: serde_json::Value,
        now: Instant,
    ) -> Result<(), ControllerError> {
        if self.active.contains_key(&kind) {
            return Ok(());
        }

        if let Some(last) = self.debounce.get(&kind) {
            if now.duration_since(*last) < DEBOUNCE {
                debug!("Alert {} debounced", kind.as_str());
                return Ok(());
            }
        }

        let ts = Utc::now();
        let id = self
            .store
            .insert_alert(ts, kind.as_str(), severity.as_str(), &message, Some(&metadata))
            .await?;

        self.active.insert(kind, id);
        self.debounce.insert(kind, now);

        self.store
            .log_event(
                "alert_created",
                &format!("Alert created: {message}"),
                Some(&json!({"alert_id": id, "alert_type": kind.as_str()})),
            )
            .await?;

        warn!("Alert created: {message}");
        self.send_webhook(kind, severity, id, ts, &message, &metadata, now);
        Ok(())
    }

    async fn clear(&mut self, kind: AlertKind, clear_message: &str) -> Result<(), ControllerError> {
        let id = match self.active.get(&kind) {
            Some(id) => *id,
            None => return Ok(()),
        };

        self.store.clear_alert(id, Utc::now()).await?;
        self.active.remove(&kind);

        self.store
            .log_event(
                "alert_cleared",
                &format!("Alert cleared: {clear_message}"),
                Some(&json!({"alert_id": id, "alert_type": kind.as_str()})),
            )
            .await?;

        info!("Alert cleared: {clear_message}");
        Ok(())
    }

    /// Fire-and-forget webhook delivery. The rate limit advances at enqueue
    /// time: a failed delivery is logged but not retried in-band.
    fn send_webhook(
        &mut self,
        kind: AlertKind,
        severity: Severity,
        alert_id: i64,
        ts: chrono::DateTime<Utc>,
        message: &str,
        metadata: &serde_json::Value,
        now: Instant,
    ) {
        let url = match &self.webhook_url {
            Some(u) => u.clone(),
            None => return,
        };

        if let Some(last) = self.last_webhook {
            if now.duration_since(last) < WEBHOOK_RATE_LIMIT {
                debug!("Webhook rate limited");
                return;
            }
        }
        self.last_webhook = Some(now);

        let client = self.client.clone();
        let store = self.store.clone();

        let body = if protocol::is_discord_webhook(&url) {
            serde_json::to_value(protocol::discord_payload(
                kind, severity, alert_id, message, ts, metadata,
            ))
        } else {
            serde_json::to_value(protocol::WebhookPayload {
                alert_id,
                alert_type: kind.as_str().to_string(),
                severity,
                message: message.to_string(),
                timestamp: ts,
                metadata: metadata.clone(),
            })
        };

        let body = match body {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to serialize webhook payload: {e}");
                return;
            }
        };

        tokio::spawn(async move {
            let result = client.post(&url).json(&body).send().await;
            match result.and_then(|r| r.error_for_status()) {
                Ok(_) => info!("Webhook sent for alert {alert_id}"),
                Err(e) => {
                    error!("Failed to send webhook: {e}");
                    let _ = store
                        .log_event(
                            "webhook_failed",
                            &format!("Webhook delivery failed for alert {alert_id}: {e}"),
                            None,
                        )
                        .await;
                }
            }
        });
    }

    /// Marks an alert acknowledged. Returns false for unknown/inactive ids.
    pub async fn acknowledge(&mut self, alert_id: i64) -> Result<bool, ControllerError> {
        let updated = self.store.acknowledge_alert(alert_id).await?;
        if updated {
            self.store
                .log_event(
                    "alert_acknowledged",
                    &format!("Alert {alert_id} acknowledged"),
                    Some(&json!({"alert_id": alert_id})),
                )
                .await?;
        }
        Ok(updated)
    }

    /// Manually clears an alert and drops its in-memory mapping.
    pub async fn clear_by_id(&mut self, alert_id: i64) -> Result<bool, ControllerError> {
        let alert = match self.store.get_alert(alert_id).await? {
            Some(a) if a.active => a,
            _ => return Ok(false),
        };

        self.store.clear_alert(alert_id, Utc::now()).await?;
        self.active.retain(|_, id| *id != alert_id);

        self.store
            .log_event(
                "alert_cleared_manual",
                &format!("Alert manually cleared: {}", alert.message),
                Some(&json!({"alert_id": alert_id})),
            )
            .await?;
        Ok(true)
    }

    /// Summary and frames for the telemetry publisher.
    pub async fn summary_and_frames(
        &self,
    ) -> Result<(AlertSummary, Vec<AlertFrame>), ControllerError> {
        let alerts = self.store.active_alerts().await?;

        let mut summary = AlertSummary {
            count: alerts.len(),
            ..Default::default()
        };

        let frames = alerts
            .into_iter()
            .map(|a| {
                let severity = Severity::parse(&a.severity).unwrap_or(Severity::Info);
                match severity {
                    Severity::Critical => summary.critical += 1,
                    Severity::Error => summary.error += 1,
                    Severity::Warning => summary.warning += 1,
                    Severity::Info => summary.info += 1,
                }
                if !a.acknowledged {
                    summary.unacknowledged += 1;
                }
                AlertFrame {
                    id: a.id,
                    ts: a.ts,
                    alert_type: a.alert_type,
                    severity,
                    message: a.message,
                    active: a.active,
                    acknowledged: a.acknowledged,
                    cleared_ts: a.cleared_ts,
                    metadata: a
                        .meta_data
                        .as_deref()
                        .and_then(|m| serde_json::from_str(m).ok()),
                }
            })
            .collect();

        Ok((summary, frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> AlertThresholds {
        AlertThresholds {
            hi_alarm_c: 135.0,
            lo_alarm_c: 65.6,
            stuck_high_rate_c_per_min: 2.0,
        }
    }

    fn input(temp_c: Option<f64>, relay_state: bool) -> AlertInput {
        AlertInput {
            temp_c,
            relay_state,
            sim_mode: true,
            hardware_fallback: false,
            thresholds: thresholds(),
        }
    }

    async fn engine() -> AlertEngine {
        let store = Store::open_in_memory().await.unwrap();
        AlertEngine::new(store, None)
    }

    #[tokio::test]
    async fn test_high_temp_activates_and_clears() {
        let mut engine = engine().await;
        let now = Instant::now();

        engine.check_alerts(&input(Some(140.0), true), now).await;
        let (summary, frames) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(frames[0].alert_type, "high_temp");

        engine
            .check_alerts(&input(Some(100.0), true), now + Duration::from_secs(10))
            .await;
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 0);
    }

    #[tokio::test]
    async fn test_active_alert_not_duplicated() {
        let mut engine = engine().await;
        let now = Instant::now();

        for i in 0..30 {
            engine
                .check_alerts(&input(Some(140.0), true), now + Duration::from_secs(i))
                .await;
        }

        // One active row despite thirty triggering ticks.
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 1);
    }

    #[tokio::test]
    async fn test_debounce_blocks_rapid_reactivation() {
        let mut engine = engine().await;
        let now = Instant::now();

        // Activate, clear two seconds later, re-trigger immediately.
        engine.check_alerts(&input(Some(140.0), true), now).await;
        engine
            .check_alerts(&input(Some(100.0), true), now + Duration::from_secs(2))
            .await;
        engine
            .check_alerts(&input(Some(141.0), true), now + Duration::from_secs(3))
            .await;

        // Still inside the 5 s debounce window: no new row.
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 0);

        // Past the debounce window the alert may activate again.
        engine
            .check_alerts(&input(Some(141.0), true), now + Duration::from_secs(6))
            .await;
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 1);
    }

    #[tokio::test]
    async fn test_stuck_high_detects_rise_with_relay_off() {
        let mut engine = engine().await;
        let start = Instant::now();

        // 100 -> 105 °C over 120 s with the relay off: 2.5 °C/min.
        for i in 0..=120u64 {
            let temp = 100.0 + 5.0 * (i as f64) / 120.0;
            engine
                .check_alerts(&input(Some(temp), false), start + Duration::from_secs(i))
                .await;
        }

        let (_, frames) = engine.summary_and_frames().await.unwrap();
        assert!(frames.iter().any(|f| f.alert_type == "stuck_high"));

        // Flat temperature clears the alert.
        for i in 121..=140u64 {
            engine
                .check_alerts(&input(Some(105.0), false), start + Duration::from_secs(i))
                .await;
        }
        let (_, frames) = engine.summary_and_frames().await.unwrap();
        assert!(!frames.iter().any(|f| f.alert_type == "stuck_high"));
    }

    #[tokio::test]
    async fn test_stuck_high_ignored_when_relay_on() {
        let mut engine = engine().await;
        let start = Instant::now();

        for i in 0..=120u64 {
            let temp = 100.0 + 5.0 * (i as f64) / 120.0;
            engine
                .check_alerts(&input(Some(temp), true), start + Duration::from_secs(i))
                .await;
        }

        let (_, frames) = engine.summary_and_frames().await.unwrap();
        assert!(!frames.iter().any(|f| f.alert_type == "stuck_high"));
    }

    #[tokio::test]
    async fn test_sensor_fault_is_critical() {
        let mut engine = engine().await;
        let now = Instant::now();

        engine.check_alerts(&input(None, false), now).await;
        let (summary, frames) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.critical, 1);
        assert_eq!(frames[0].alert_type, "sensor_fault");

        engine
            .check_alerts(&input(Some(100.0), false), now + Duration::from_secs(10))
            .await;
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.critical, 0);
    }

    #[tokio::test]
    async fn test_hardware_fallback_alert() {
        let mut engine = engine().await;
        let now = Instant::now();

        let mut snapshot = input(Some(100.0), false);
        snapshot.sim_mode = false;
        snapshot.hardware_fallback = true;
        engine.check_alerts(&snapshot, now).await;

        let (summary, frames) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.warning, 1);
        assert_eq!(frames[0].alert_type, "hardware_fallback");

        // Recovered hardware clears it.
        snapshot.hardware_fallback = false;
        engine
            .check_alerts(&snapshot, now + Duration::from_secs(10))
            .await;
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 0);
    }

    #[tokio::test]
    async fn test_manual_acknowledge_and_clear() {
        let mut engine = engine().await;
        let now = Instant::now();

        engine.check_alerts(&input(Some(140.0), true), now).await;
        let (_, frames) = engine.summary_and_frames().await.unwrap();
        let id = frames[0].id;

        assert!(engine.acknowledge(id).await.unwrap());
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.unacknowledged, 0);

        assert!(engine.clear_by_id(id).await.unwrap());
        assert!(!engine.clear_by_id(id).await.unwrap());
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 0);

        // The in-memory mapping was dropped, so after the debounce window
        // the condition may create a fresh row.
        engine
            .check_alerts(&input(Some(140.0), true), now + Duration::from_secs(6))
            .await;
        let (summary, _) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 1);
    }

    #[tokio::test]
    async fn test_adopts_persisted_active_alerts() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_alert(Utc::now(), "high_temp", "error", "too hot", None)
            .await
            .unwrap();

        let mut engine = AlertEngine::new(store.clone(), None);
        engine.load_active().await.unwrap();

        // The adopted row suppresses a duplicate insert.
        engine
            .check_alerts(&input(Some(140.0), true), Instant::now())
            .await;
        let (summary, frames) = engine.summary_and_frames().await.unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(frames[0].id, id);
    }
}
