//! The pit controller: monitoring loop, control loop, and operations.
//!
//! Two periodic bodies share this struct. The monitoring body runs from boot
//! and refreshes the latest-readings snapshot every second; the control body
//! runs only while the controller is started and owns every control
//! decision. Both are driven by tasks in `main.rs`; neither body overlaps
//! the other because the application serializes access through one lock.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use config_types::{celsius_to_fahrenheit, fahrenheit_to_celsius, ControlMode};
use protocol::{ChannelMode, ChannelReading, PhaseEvent, TelemetryData};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEngine, AlertInput, AlertThresholds};
use crate::control::{
    thermostat_intent, AdaptiveConfig, AdaptiveStatus, AdaptiveTuner, AutoTuneConfig,
    AutoTuneStatus, AutoTuner, DutyWindow, DwellGate, Pid, PidState, TuningRule,
};
use crate::db::{NewReading, NewThermocoupleReading, SettingsRow, Store};
use crate::hardware::{RelayDriver, SensorManager};
use crate::phases::{snapshot_of, PhaseManager};
use crate::session::SessionCoordinator;
use crate::ControllerError;

/// Runtime control settings, loaded from the settings row at startup and on
/// explicit reload.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub setpoint_c: f64,
    pub setpoint_f: f64,
    pub control_mode: ControlMode,
    pub min_on_s: f64,
    pub min_off_s: f64,
    pub hyst_c: f64,
    pub time_window_s: f64,
    pub sim_mode: bool,
    pub gpio_pin: u8,
    pub relay_active_high: bool,
    pub boost_duration_s: i64,
    pub hi_alarm_c: f64,
    pub lo_alarm_c: f64,
    pub stuck_high_rate_c_per_min: f64,
}

impl From<&SettingsRow> for ControlSettings {
    fn from(row: &SettingsRow) -> Self {
        let control_mode =
            ControlMode::parse(&row.control_mode).unwrap_or(ControlMode::Thermostat);
        Self {
            setpoint_c: row.setpoint_c,
            setpoint_f: row.setpoint_f,
            control_mode,
            min_on_s: row.min_on_s as f64,
            min_off_s: row.min_off_s as f64,
            hyst_c: row.hyst_c,
            time_window_s: row.time_window_s as f64,
            sim_mode: row.sim_mode,
            gpio_pin: row.gpio_pin as u8,
            relay_active_high: row.relay_active_high,
            boost_duration_s: row.boost_duration_s,
            hi_alarm_c: row.hi_alarm_c,
            lo_alarm_c: row.lo_alarm_c,
            stuck_high_rate_c_per_min: row.stuck_high_rate_c_per_min,
        }
    }
}

/// Diagnostic snapshot beyond the telemetry frame.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Diagnostics {
    pub pid_state: PidState,
    pub control_tc_id: Option<i64>,
    pub sim_mode: bool,
    pub using_fallback: bool,
    pub autotune: Option<AutoTuneStatus>,
    pub adaptive: AdaptiveStatus,
}

pub struct Controller {
    store: Store,
    settings: ControlSettings,

    sensors: SensorManager,
    relay: RelayDriver,

    pid: Pid,
    adaptive: AdaptiveTuner,
    autotuner: Option<AutoTuner>,
    autotune_auto_apply: bool,
    dwell: DwellGate,
    duty: DutyWindow,

    phases: PhaseManager,
    session: SessionCoordinator,
    alerts: AlertEngine,
    events_tx: broadcast::Sender<String>,

    running: bool,
    boost_active: bool,
    boost_until: Option<DateTime<Utc>>,

    control_tc_id: Option<i64>,
    readings: HashMap<i64, (Option<f64>, bool)>,
    current_temp_c: Option<f64>,

    pid_output: f64,
    output_bool: bool,
    loop_count: u64,
    last_loop_time: Option<f64>,
    stall_detected: bool,
}

impl Controller {
    /// Builds the controller: hardware from settings, channels from the
    /// store, and the active cook (if any) bound so its phase target applies
    /// before the first tick.
    pub async fn initialize(
        store: Store,
        settings_row: &SettingsRow,
        events_tx: broadcast::Sender<String>,
    ) -> Result<Self, ControllerError> {
        let settings = ControlSettings::from(settings_row);
        info!(
            "Controller initializing (sim_mode={}, mode={})",
            settings.sim_mode,
            settings.control_mode.as_str()
        );

        let relay = RelayDriver::new(
            settings.sim_mode,
            settings.gpio_pin,
            settings.relay_active_high,
        );
        let sensors = SensorManager::new(settings.sim_mode);

        let mut alerts = AlertEngine::new(store.clone(), settings_row.webhook_url.clone());
        alerts.load_active().await?;

        let pid = Pid::new(settings_row.kp, settings_row.ki, settings_row.kd);
        let mut adaptive = AdaptiveTuner::new(AdaptiveConfig::default());
        if settings_row.adaptive_pid_enabled && settings.control_mode == ControlMode::TimeProportional
        {
            adaptive.enable();
        }

        let mut controller = Self {
            store,
            settings,
            sensors,
            relay,
            pid,
            adaptive,
            autotuner: None,
            autotune_auto_apply: false,
            dwell: DwellGate::new(),
            duty: DutyWindow::new(),
            phases: PhaseManager::new(),
            session: SessionCoordinator::new(),
            alerts,
            events_tx,
            running: false,
            boost_active: false,
            boost_until: None,
            control_tc_id: None,
            readings: HashMap::new(),
            current_temp_c: None,
            pid_output: 0.0,
            output_bool: false,
            loop_count: 0,
            last_loop_time: None,
            stall_detected: false,
        };

        controller.load_thermocouples().await?;
        controller.load_session().await?;

        if controller.hardware_fallback() {
            warn!("Hardware fallback in effect; check sensor wiring and CS pins");
        }

        info!("Controller initialized");
        Ok(controller)
    }

    /// (Re)loads channel configuration from the store.
    pub async fn load_thermocouples(&mut self) -> Result<(), ControllerError> {
        let tcs = self.store.enabled_thermocouples().await?;

        self.sensors.clear();
        self.readings.clear();
        self.control_tc_id = None;

        if tcs.is_empty() {
            warn!("No thermocouples configured");
            return Ok(());
        }

        for tc in &tcs {
            self.sensors.add_channel(tc, self.settings.setpoint_c);
            if tc.is_control {
                self.control_tc_id = Some(tc.id);
                info!("Control thermocouple: {} (id={})", tc.name, tc.id);
            }
        }

        if self.control_tc_id.is_none() {
            self.control_tc_id = Some(tcs[0].id);
            warn!(
                "No control thermocouple specified; using first: {}",
                tcs[0].name
            );
        }

        Ok(())
    }

    async fn load_session(&mut self) -> Result<(), ControllerError> {
        if let Some((_, Some(phase))) = self.session.load_active_smoke(&self.store).await? {
            self.apply_setpoint_f(phase.target_temp_f);
        }
        Ok(())
    }

    // Lifecycle

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Enables active control. Monitoring runs regardless.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        if self.running {
            warn!("Controller already running");
            return Ok(());
        }

        // Pick up relay settings edited while stopped.
        if let Some(row) = self.store.get_settings().await? {
            if self.relay.pin() != row.gpio_pin as u8
                || self.relay.active_high() != row.relay_active_high
            {
                info!("Relay settings changed in store; reconfiguring");
                self.relay
                    .reinitialize(row.gpio_pin as u8, row.relay_active_high);
            }
        }

        // Re-apply the active phase target in case the session changed.
        if let Some(smoke_id) = self.session.active_smoke_id() {
            if let Some(phase) = self.store.current_phase(smoke_id).await? {
                self.apply_setpoint_f(phase.target_temp_f);
            }
        }

        self.running = true;
        self.log_event("controller_start", "Controller started").await;
        info!("Controller started (active control enabled)");
        Ok(())
    }

    /// Disables active control and de-energizes the relay. Monitoring
    /// continues.
    pub async fn stop(&mut self) -> Result<(), ControllerError> {
        if !self.running {
            warn!("Controller not running");
            return Ok(());
        }

        self.running = false;
        self.relay.set_state(false);
        self.output_bool = false;

        self.log_event("controller_stop", "Controller stopped").await;
        info!("Controller stopped (monitoring continues)");
        Ok(())
    }

    // Periodic bodies

    /// Monitoring body: refreshes the latest-readings snapshot. Runs every
    /// second from boot, whether or not control is active.
    pub async fn poll_sensors(&mut self, now: Instant) {
        self.readings = self.sensors.read_all(now).await;

        if let Some(tc_id) = self.control_tc_id {
            if let Some((Some(temp), false)) = self.readings.get(&tc_id) {
                self.current_temp_c = Some(*temp);
            }
        }
    }

    /// Control body: one tick of read → decide → actuate → log → alert.
    /// Every sub-step has a soft-failure boundary; the loop itself never
    /// propagates an error.
    pub async fn tick(&mut self, now: Instant) {
        let tick_started = Instant::now();

        let (control_temp, control_fault) = self.control_reading();

        match control_temp {
            Some(temp) if !control_fault => {
                self.expire_boost().await;
                self.run_strategy(temp, now).await;
                self.check_phases(temp).await;
            }
            _ => {
                // Hard local cancellation of the control action: relay off,
                // tuner killed, but logging and alerts still run below.
                self.output_bool = false;
                self.relay.set_state(false);

                if self.autotune_active() {
                    error!("Sensor fault during auto-tune; aborting run");
                    if let Some(tuner) = &mut self.autotuner {
                        tuner.fail_on_sensor_fault();
                    }
                    self.log_event("autotune_failed", "Auto-tune aborted: sensor fault")
                        .await;
                }

                self.log_event(
                    "sensor_fault",
                    &format!(
                        "Control thermocouple reading failed (id={:?})",
                        self.control_tc_id
                    ),
                )
                .await;
            }
        }

        if let Err(e) = self.append_reading().await {
            // Nothing in memory mutates on a failed append; next tick
            // simply writes a fresh row.
            error!("Failed to log reading: {e}");
        }

        let alert_input = AlertInput {
            temp_c: if control_fault { None } else { control_temp },
            relay_state: self.relay.current_state(),
            sim_mode: self.settings.sim_mode,
            hardware_fallback: self.hardware_fallback(),
            thresholds: AlertThresholds {
                hi_alarm_c: self.settings.hi_alarm_c,
                lo_alarm_c: self.settings.lo_alarm_c,
                stuck_high_rate_c_per_min: self.settings.stuck_high_rate_c_per_min,
            },
        };
        self.alerts.check_alerts(&alert_input, now).await;

        self.loop_count += 1;
        self.last_loop_time = Some(tick_started.elapsed().as_secs_f64());
    }

    fn control_reading(&self) -> (Option<f64>, bool) {
        match self.control_tc_id.and_then(|id| self.readings.get(&id)) {
            Some((temp, fault)) => (*temp, *fault),
            None => (None, true),
        }
    }

    async fn expire_boost(&mut self) {
        if self.boost_active && self.boost_until.is_some_and(|until| Utc::now() >= until) {
            self.boost_active = false;
            self.boost_until = None;
            self.log_event("boost_disabled", "Boost mode expired").await;
        }
    }

    async fn run_strategy(&mut self, temp_c: f64, now: Instant) {
        if self.autotune_active() {
            self.autotune_step(temp_c, now).await;
        } else if self.boost_active {
            // Boost overrides everything; dwell deliberately bypassed.
            self.output_bool = true;
            self.relay.set_state(true);
        } else {
            match self.settings.control_mode {
                ControlMode::Thermostat => self.thermostat_step(temp_c, now),
                ControlMode::TimeProportional => self.time_proportional_step(temp_c, now).await,
            }
        }
    }

    fn thermostat_step(&mut self, temp_c: f64, now: Instant) {
        self.output_bool = thermostat_intent(
            self.output_bool,
            temp_c,
            self.settings.setpoint_c,
            self.settings.hyst_c,
        );
        self.pid_output = if self.output_bool { 100.0 } else { 0.0 };

        if let Some(state) = self.dwell.apply(
            self.output_bool,
            self.relay.current_state(),
            now,
            self.settings.min_on_s,
            self.settings.min_off_s,
        ) {
            self.relay.set_state(state);
        }
    }

    async fn time_proportional_step(&mut self, temp_c: f64, now: Instant) {
        let setpoint = self.settings.setpoint_c;
        let error = setpoint - temp_c;

        self.adaptive.record_sample(temp_c, setpoint, error);
        if let Some(adj) =
            self.adaptive
                .evaluate_and_adjust(self.pid.kp, self.pid.ki, self.pid.kd, now)
        {
            self.pid.set_gains(adj.kp, adj.ki, adj.kd);
            if let Err(e) = self.store.save_pid_gains(adj.kp, adj.ki, adj.kd).await {
                error!("Failed to persist adaptive gains: {e}");
            }
            self.log_event(
                "adaptive_pid_adjustment",
                &format!(
                    "Adaptive PID: {} | Kp={:.4}, Ki={:.4}, Kd={:.4}",
                    adj.reason, adj.kp, adj.ki, adj.kd
                ),
            )
            .await;
        }

        self.pid_output = self.pid.compute(setpoint, temp_c);
        self.output_bool = self
            .duty
            .update(self.pid_output, self.settings.time_window_s, now);
        // Window discipline is the only switching gate in this mode.
        self.relay.set_state(self.output_bool);
    }

    async fn autotune_step(&mut self, temp_c: f64, now: Instant) {
        let (output, complete) = match &mut self.autotuner {
            Some(tuner) => tuner.update(temp_c, now),
            None => return,
        };

        self.pid_output = output;
        self.output_bool = output > 0.0;
        self.relay.set_state(self.output_bool);

        if !complete {
            return;
        }

        let state = self.autotuner.as_ref().map(|t| t.state());
        if state == Some(crate::control::AutoTuneState::Succeeded) {
            let gains = self.autotuner.as_ref().and_then(|t| t.gains());
            if let Some((kp, ki, kd)) = gains {
                info!(
                    "Auto-tune complete: Kp={kp:.4} Ki={ki:.4} Kd={kd:.4}"
                );
                self.log_event(
                    "autotune_complete",
                    &format!("Auto-tune completed: Kp={kp:.4}, Ki={ki:.4}, Kd={kd:.4}"),
                )
                .await;

                if self.autotune_auto_apply {
                    if let Err(e) = self.apply_autotune_gains().await {
                        error!("Failed to apply auto-tuned gains: {e}");
                    }
                }
                // Without auto-apply the tuner is kept so the operator can
                // inspect and apply the gains explicitly.
            }
        } else {
            self.log_event("autotune_failed", "Auto-tune failed or cancelled")
                .await;
            self.autotuner = None;
        }
    }

    async fn check_phases(&mut self, temp_c: f64) {
        let smoke_id = match self.session.active_smoke_id() {
            Some(id) => id,
            None => return,
        };

        let now = Utc::now();
        let smoke = match self.store.get_smoke(smoke_id).await {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to load smoke {smoke_id}: {e}");
                return;
            }
        };

        // Meat probe reading, if the session has one configured.
        let meat_temp_f = smoke.meat_probe_tc_id.and_then(|tc_id| {
            self.readings
                .get(&tc_id)
                .and_then(|(temp, fault)| match (temp, fault) {
                    (Some(t), false) => Some(celsius_to_fahrenheit(*t)),
                    _ => None,
                })
        });

        self.stall_detected = self.phases.detect_stall(smoke_id, meat_temp_f, now);

        // An already-pending session waits for the user; a paused phase
        // suspends checks but not control.
        if smoke.pending_phase_transition {
            return;
        }
        match self.store.current_phase(smoke_id).await {
            Ok(Some(phase)) if phase.is_paused => return,
            Ok(Some(_)) => {}
            _ => return,
        }

        let current_temp_f = celsius_to_fahrenheit(temp_c);
        let reason = match self
            .phases
            .check_conditions(&self.store, smoke_id, current_temp_f, meat_temp_f, now)
            .await
        {
            Ok(Some(reason)) => reason,
            Ok(None) => return,
            Err(e) => {
                error!("Phase condition check failed: {e}");
                return;
            }
        };

        match self
            .phases
            .request_transition(&self.store, smoke_id, &reason)
            .await
        {
            Ok(true) => {
                self.log_event(
                    "phase_transition_ready",
                    &format!("Phase transition ready: {reason}"),
                )
                .await;
                self.broadcast_phase_event(smoke_id, &reason).await;
            }
            Ok(false) => {}
            Err(e) => error!("Failed to request phase transition: {e}"),
        }
    }

    async fn broadcast_phase_event(&mut self, smoke_id: i64, reason: &str) {
        let current = self
            .store
            .current_phase(smoke_id)
            .await
            .ok()
            .flatten()
            .map(|p| snapshot_of(&p));
        let next = match &current {
            Some(c) => self
                .store
                .phase_by_order(smoke_id, c.phase_order + 1)
                .await
                .ok()
                .flatten()
                .map(|p| snapshot_of(&p)),
            None => None,
        };

        let event = PhaseEvent::transition_ready(
            Utc::now(),
            smoke_id,
            reason.to_string(),
            current,
            next,
        );
        match serde_json::to_string(&event) {
            Ok(json) => {
                let _ = self.events_tx.send(json);
            }
            Err(e) => error!("Failed to serialize phase event: {e}"),
        }
    }

    async fn append_reading(&mut self) -> Result<(), ControllerError> {
        // With no temperature ever observed there is nothing meaningful to
        // append; alerts still see the fault through the snapshot.
        let (control_temp, _) = self.control_reading();
        let temp_c = match control_temp.or(self.current_temp_c) {
            Some(t) => t,
            None => return Ok(()),
        };

        let reading = NewReading {
            ts: Utc::now(),
            smoke_id: self.session.active_smoke_id(),
            temp_c,
            temp_f: celsius_to_fahrenheit(temp_c),
            setpoint_c: self.settings.setpoint_c,
            setpoint_f: self.settings.setpoint_f,
            output_bool: self.output_bool,
            relay_state: self.relay.current_state(),
            loop_ms: self
                .last_loop_time
                .map(|t| (t * 1000.0) as i64)
                .unwrap_or(0),
            pid_output: self.pid_output,
            boost_active: self.boost_active,
        };

        let channels: Vec<NewThermocoupleReading> = self
            .readings
            .iter()
            .filter_map(|(id, (temp, fault))| {
                temp.map(|t| NewThermocoupleReading {
                    thermocouple_id: *id,
                    temp_c: t,
                    temp_f: celsius_to_fahrenheit(t),
                    fault: *fault,
                })
            })
            .collect();

        self.store.append_reading(&reading, &channels).await?;
        Ok(())
    }

    // Operations

    /// Applies a new setpoint (authoritative in °F at the API edge, stored
    /// in both scales).
    pub async fn set_setpoint(&mut self, setpoint_f: f64) -> Result<(), ControllerError> {
        let old = self.settings.setpoint_f;
        self.apply_setpoint_f(setpoint_f);

        self.store
            .save_setpoint(self.settings.setpoint_c, self.settings.setpoint_f)
            .await?;
        self.log_event(
            "setpoint_change",
            &format!("Setpoint changed from {old:.1}\u{00B0}F to {setpoint_f:.1}\u{00B0}F"),
        )
        .await;
        info!(
            "Setpoint updated to {:.1}F ({:.1}C)",
            self.settings.setpoint_f, self.settings.setpoint_c
        );
        Ok(())
    }

    fn apply_setpoint_f(&mut self, setpoint_f: f64) {
        self.settings.setpoint_f = setpoint_f;
        self.settings.setpoint_c = fahrenheit_to_celsius(setpoint_f);
        self.sensors.update_setpoint(self.settings.setpoint_c);
    }

    pub async fn set_pid_gains(&mut self, kp: f64, ki: f64, kd: f64) -> Result<(), ControllerError> {
        if kp < 0.0 || ki < 0.0 || kd < 0.0 {
            return Err(ControllerError::InvalidCommand(
                "PID gains must be non-negative".into(),
            ));
        }
        self.pid.set_gains(kp, ki, kd);
        self.store.save_pid_gains(kp, ki, kd).await?;
        self.log_event(
            "pid_gains_change",
            &format!("PID gains updated: Kp={kp}, Ki={ki}, Kd={kd}"),
        )
        .await;
        Ok(())
    }

    pub async fn set_timing_params(
        &mut self,
        min_on_s: f64,
        min_off_s: f64,
        hyst_c: f64,
        time_window_s: Option<f64>,
    ) -> Result<(), ControllerError> {
        if min_on_s < 0.0 || min_off_s < 0.0 || hyst_c < 0.0 {
            return Err(ControllerError::InvalidCommand(
                "timing parameters must be non-negative".into(),
            ));
        }
        if time_window_s.is_some_and(|w| w <= 0.0) {
            return Err(ControllerError::InvalidCommand(
                "time window must be positive".into(),
            ));
        }

        self.settings.min_on_s = min_on_s;
        self.settings.min_off_s = min_off_s;
        self.settings.hyst_c = hyst_c;
        if let Some(window) = time_window_s {
            self.settings.time_window_s = window;
        }

        self.log_event(
            "timing_params_change",
            &format!(
                "Timing updated: min_on={min_on_s}s, min_off={min_off_s}s, hyst={hyst_c:.1}\u{00B0}C, window={}s",
                self.settings.time_window_s
            ),
        )
        .await;
        Ok(())
    }

    /// Switches control mode, resetting per-mode state so the new law
    /// starts clean.
    pub async fn set_control_mode(&mut self, mode: ControlMode) -> Result<(), ControllerError> {
        let old = self.settings.control_mode;
        if old == mode {
            return Ok(());
        }

        self.settings.control_mode = mode;
        self.pid.reset();
        self.duty.reset();
        self.dwell.reset();

        match mode {
            ControlMode::TimeProportional => {
                let enabled = self
                    .store
                    .get_settings()
                    .await?
                    .map(|row| row.adaptive_pid_enabled)
                    .unwrap_or(true);
                if enabled {
                    self.adaptive.enable();
                }
            }
            ControlMode::Thermostat => self.adaptive.disable(),
        }

        self.store.save_control_mode(mode.as_str()).await?;
        self.log_event(
            "control_mode_change",
            &format!(
                "Control mode changed from {} to {}",
                old.as_str(),
                mode.as_str()
            ),
        )
        .await;
        Ok(())
    }

    // Boost

    pub async fn enable_boost(&mut self, duration_s: Option<i64>) -> Result<(), ControllerError> {
        let duration = duration_s.unwrap_or(self.settings.boost_duration_s);
        if duration <= 0 {
            return Err(ControllerError::InvalidCommand(
                "boost duration must be positive".into(),
            ));
        }

        self.boost_active = true;
        self.boost_until = Some(Utc::now() + ChronoDuration::seconds(duration));
        self.log_event(
            "boost_enabled",
            &format!("Boost mode enabled for {duration} seconds"),
        )
        .await;
        Ok(())
    }

    pub async fn disable_boost(&mut self) -> Result<(), ControllerError> {
        self.boost_active = false;
        self.boost_until = None;
        self.log_event("boost_disabled", "Boost mode disabled").await;
        Ok(())
    }

    // Auto-tune

    pub fn autotune_active(&self) -> bool {
        self.autotuner
            .as_ref()
            .is_some_and(|t| !t.state().is_terminal() && t.state() != crate::control::AutoTuneState::Idle)
    }

    /// Starts a relay-feedback run. Requires the controller running, time-
    /// proportional mode, and no active cook.
    pub async fn start_autotune(
        &mut self,
        output_step: f64,
        lookback_seconds: f64,
        noise_band_c: f64,
        tuning_rule: TuningRule,
        auto_apply: bool,
        now: Instant,
    ) -> Result<(), ControllerError> {
        if !self.running {
            return Err(ControllerError::InvalidCommand(
                "controller must be running to auto-tune".into(),
            ));
        }
        if self.autotune_active() {
            return Err(ControllerError::InvalidCommand(
                "auto-tune already active".into(),
            ));
        }
        if self.session.active_smoke_id().is_some() {
            return Err(ControllerError::InvalidCommand(
                "cannot auto-tune during an active cook".into(),
            ));
        }
        if self.settings.control_mode != ControlMode::TimeProportional {
            return Err(ControllerError::InvalidCommand(
                "auto-tune requires time-proportional mode".into(),
            ));
        }
        if !(0.0..=100.0).contains(&output_step) || output_step == 0.0 {
            return Err(ControllerError::InvalidCommand(
                "output step must be in (0, 100]".into(),
            ));
        }

        let mut tuner = AutoTuner::new(AutoTuneConfig {
            setpoint_c: self.settings.setpoint_c,
            output_step,
            lookback_seconds,
            noise_band_c,
            sample_time: 1.0,
            tuning_rule,
        });
        if !tuner.start(now) {
            return Err(ControllerError::InvalidCommand(
                "auto-tuner failed to start".into(),
            ));
        }

        self.autotuner = Some(tuner);
        self.autotune_auto_apply = auto_apply;
        self.log_event(
            "autotune_start",
            &format!(
                "Auto-tune started: setpoint={:.1}\u{00B0}F, rule={}, auto_apply={auto_apply}",
                self.settings.setpoint_f,
                tuning_rule.as_str()
            ),
        )
        .await;
        Ok(())
    }

    pub async fn cancel_autotune(&mut self) -> Result<(), ControllerError> {
        let tuner = self.autotuner.as_mut().ok_or_else(|| {
            ControllerError::InvalidCommand("no auto-tune active to cancel".into())
        })?;
        tuner.cancel();
        self.autotuner = None;
        self.log_event("autotune_cancel", "Auto-tune cancelled by user")
            .await;
        Ok(())
    }

    /// Applies tuned gains to the live PID and persists them. A separate,
    /// explicit step from the run itself.
    pub async fn apply_autotune_gains(&mut self) -> Result<(), ControllerError> {
        let gains = self.autotuner.as_ref().and_then(|t| t.gains());
        let (kp, ki, kd) = gains.ok_or_else(|| {
            ControllerError::InvalidCommand("auto-tuner has no valid gains to apply".into())
        })?;

        self.pid.set_gains(kp, ki, kd);
        self.store.save_pid_gains(kp, ki, kd).await?;
        self.log_event(
            "autotune_apply",
            &format!("Auto-tuned PID gains applied: Kp={kp:.4}, Ki={ki:.4}, Kd={kd:.4}"),
        )
        .await;

        self.autotuner = None;
        Ok(())
    }

    pub fn autotune_status(&self, now: Instant) -> Option<AutoTuneStatus> {
        self.autotuner.as_ref().map(|t| t.status(now))
    }

    // Adaptive tuning

    pub async fn enable_adaptive(&mut self) -> Result<(), ControllerError> {
        if self.settings.control_mode != ControlMode::TimeProportional {
            return Err(ControllerError::InvalidCommand(
                "adaptive tuning requires time-proportional mode".into(),
            ));
        }
        self.adaptive.enable();
        self.store.save_adaptive_enabled(true).await?;
        Ok(())
    }

    pub async fn disable_adaptive(&mut self) -> Result<(), ControllerError> {
        self.adaptive.disable();
        self.store.save_adaptive_enabled(false).await?;
        Ok(())
    }

    // Sessions and phases

    pub async fn set_active_smoke(&mut self, smoke_id: i64) -> Result<(), ControllerError> {
        if let Some(target_f) = self.session.set_active_smoke(&self.store, smoke_id).await? {
            self.apply_setpoint_f(target_f);
        }
        Ok(())
    }

    pub async fn end_session(&mut self) -> Result<(), ControllerError> {
        if let Some(id) = self.session.active_smoke_id() {
            self.phases.forget_session(id);
        }
        self.session.end_session(&self.store).await
    }

    /// User approval of a pending transition; applies the next phase's
    /// target to the live setpoint.
    pub async fn approve_phase_transition(&mut self) -> Result<(), ControllerError> {
        let smoke_id = self
            .session
            .active_smoke_id()
            .ok_or_else(|| ControllerError::InvalidCommand("no active cook".into()))?;

        let next = self
            .phases
            .approve_transition(&self.store, smoke_id, Utc::now())
            .await?;
        if let Some(phase) = next {
            self.apply_setpoint_f(phase.target_temp_f);
        }
        Ok(())
    }

    pub async fn skip_phase(&mut self) -> Result<(), ControllerError> {
        let smoke_id = self
            .session
            .active_smoke_id()
            .ok_or_else(|| ControllerError::InvalidCommand("no active cook".into()))?;

        let next = self
            .phases
            .skip_phase(&self.store, smoke_id, Utc::now())
            .await?;
        if let Some(phase) = next {
            self.apply_setpoint_f(phase.target_temp_f);
        }
        Ok(())
    }

    pub async fn pause_phase(&mut self) -> Result<(), ControllerError> {
        let smoke_id = self
            .session
            .active_smoke_id()
            .ok_or_else(|| ControllerError::InvalidCommand("no active cook".into()))?;
        self.phases.pause_phase(&self.store, smoke_id).await
    }

    pub async fn resume_phase(&mut self) -> Result<(), ControllerError> {
        let smoke_id = self
            .session
            .active_smoke_id()
            .ok_or_else(|| ControllerError::InvalidCommand("no active cook".into()))?;
        self.phases.resume_phase(&self.store, smoke_id).await
    }

    /// Edits the active phase's target temperature; applies immediately to
    /// the live setpoint.
    pub async fn update_active_phase_target(
        &mut self,
        target_temp_f: f64,
    ) -> Result<(), ControllerError> {
        let smoke_id = self
            .session
            .active_smoke_id()
            .ok_or_else(|| ControllerError::InvalidCommand("no active cook".into()))?;
        let phase = self
            .store
            .current_phase(smoke_id)
            .await?
            .ok_or_else(|| ControllerError::InvalidCommand("no active phase".into()))?;

        self.store
            .update_phase_target(phase.id, target_temp_f)
            .await?;
        self.apply_setpoint_f(target_temp_f);
        Ok(())
    }

    // Hardware maintenance

    /// Applies new relay pin/polarity at runtime.
    pub async fn update_relay_settings(
        &mut self,
        gpio_pin: u8,
        relay_active_high: bool,
    ) -> Result<(), ControllerError> {
        self.settings.gpio_pin = gpio_pin;
        self.settings.relay_active_high = relay_active_high;
        self.relay.reinitialize(gpio_pin, relay_active_high);
        Ok(())
    }

    /// Rebuilds sensors and relay for a new simulation mode. Refused while
    /// control is active.
    pub async fn reload_hardware(&mut self, sim_mode: bool) -> Result<(), ControllerError> {
        if self.running {
            return Err(ControllerError::InvalidCommand(
                "stop the controller before reloading hardware".into(),
            ));
        }

        self.settings.sim_mode = sim_mode;
        self.relay = RelayDriver::new(
            sim_mode,
            self.settings.gpio_pin,
            self.settings.relay_active_high,
        );
        self.sensors = SensorManager::new(sim_mode);
        self.load_thermocouples().await?;
        info!("Hardware reloaded (sim_mode={sim_mode})");
        Ok(())
    }

    pub fn hardware_fallback(&self) -> bool {
        self.relay.is_fallback() || self.sensors.has_fallback()
    }

    // Snapshots

    /// Telemetry frame payload, including the active alert summary.
    pub async fn telemetry_data(&self) -> Result<TelemetryData, ControllerError> {
        let (alert_summary, alerts) = self.alerts.summary_and_frames().await?;

        let modes = self.sensors.channel_modes();
        let mut thermocouple_readings = BTreeMap::new();
        for (id, (temp, fault)) in &self.readings {
            if let Some(t) = temp {
                thermocouple_readings.insert(
                    id.to_string(),
                    ChannelReading {
                        temp_c: *t,
                        temp_f: celsius_to_fahrenheit(*t),
                        fault: *fault,
                        mode: modes.get(id).copied().unwrap_or(ChannelMode::Simulated),
                    },
                );
            }
        }

        let (current_phase, pending) = match self.session.active_smoke_id() {
            Some(smoke_id) => {
                let phase = self.phases.phase_snapshot(&self.store, smoke_id).await?;
                let pending = self
                    .store
                    .get_smoke(smoke_id)
                    .await?
                    .map(|s| s.pending_phase_transition)
                    .unwrap_or(false);
                (phase, pending)
            }
            None => (None, false),
        };

        Ok(TelemetryData {
            running: self.running,
            boost_active: self.boost_active,
            boost_until: self.boost_until,
            control_mode: self.settings.control_mode.as_str().to_string(),
            active_smoke_id: self.session.active_smoke_id(),
            current_temp_c: self.current_temp_c,
            current_temp_f: self.current_temp_c.map(celsius_to_fahrenheit),
            setpoint_c: self.settings.setpoint_c,
            setpoint_f: self.settings.setpoint_f,
            pid_output: self.pid_output,
            output_bool: self.output_bool,
            relay_state: self.relay.current_state(),
            loop_count: self.loop_count,
            last_loop_time: self.last_loop_time,
            thermocouple_readings,
            alert_summary,
            alerts,
            current_phase,
            pending_phase_transition: pending,
            stall_detected: self.stall_detected,
        })
    }

    pub fn diagnostics(&self, now: Instant) -> Diagnostics {
        Diagnostics {
            pid_state: self.pid.state(),
            control_tc_id: self.control_tc_id,
            sim_mode: self.settings.sim_mode,
            using_fallback: self.hardware_fallback(),
            autotune: self.autotune_status(now),
            adaptive: self.adaptive.status(now),
        }
    }

    pub fn alerts_mut(&mut self) -> &mut AlertEngine {
        &mut self.alerts
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    async fn log_event(&self, kind: &str, message: &str) {
        if let Err(e) = self.store.log_event(kind, message, None).await {
            error!("Failed to log event {kind}: {e}");
        } else {
            debug!("Event: {kind}: {message}");
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_reading(&mut self, tc_id: i64, temp_c: Option<f64>, fault: bool) {
        self.readings.insert(tc_id, (temp_c, fault));
        if let (Some(t), false) = (temp_c, fault) {
            if self.control_tc_id == Some(tc_id) {
                self.current_temp_c = Some(t);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_running(&mut self) {
        self.running = true;
    }

    #[cfg(test)]
    pub(crate) fn relay_state(&self) -> bool {
        self.relay.current_state()
    }

    #[cfg(test)]
    pub(crate) fn pid_state(&self) -> PidState {
        self.pid.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_types::EnvConfig;

    async fn setup(control_mode: ControlMode) -> (Store, Controller, i64) {
        let store = Store::open_in_memory().await.unwrap();
        let env = EnvConfig {
            sim_mode: true,
            control_mode,
            ..EnvConfig::default()
        };
        let settings = store.ensure_settings(&env).await.unwrap();
        let tc_id = store
            .insert_thermocouple("Pit", 8, true, 0, "#3b82f6")
            .await
            .unwrap();

        let (events_tx, _) = broadcast::channel(16);
        let controller = Controller::initialize(store.clone(), &settings, events_tx)
            .await
            .unwrap();
        (store, controller, tc_id)
    }

    #[tokio::test]
    async fn test_sensor_fault_forces_relay_off_and_freezes_pid() {
        let (_store, mut controller, tc_id) = setup(ControlMode::TimeProportional).await;
        controller.force_running();

        // First tick primes the PID and latches an empty duty window; the
        // second tick lands in a fresh window where the PID output applies.
        let start = Instant::now();
        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(start).await;
        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(start + std::time::Duration::from_secs(10)).await;

        let integral_before = controller.pid_state().integral;
        assert!(controller.relay_state());

        // Fault tick: relay off, integrator untouched.
        controller.inject_reading(tc_id, Some(100.0), true);
        controller.tick(start + std::time::Duration::from_secs(11)).await;

        assert!(!controller.relay_state());
        assert!(!controller.output_bool);
        assert_eq!(controller.pid_state().integral, integral_before);
    }

    #[tokio::test]
    async fn test_fault_tick_still_logs_reading_and_alert() {
        let (store, mut controller, tc_id) = setup(ControlMode::Thermostat).await;
        controller.force_running();

        let start = Instant::now();
        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(start).await;

        controller.inject_reading(tc_id, Some(100.0), true);
        controller.tick(start + std::time::Duration::from_secs(1)).await;

        // Both ticks appended a row (the fault tick used last-known).
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reading")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 2);

        // The sensor-fault alert activated.
        let alerts = store.active_alerts().await.unwrap();
        assert!(alerts.iter().any(|a| a.alert_type == "sensor_fault"));

        let events = store.recent_events(10).await.unwrap();
        assert!(events.iter().any(|e| e.kind == "sensor_fault"));
    }

    #[tokio::test]
    async fn test_thermostat_tick_drives_relay() {
        let (_store, mut controller, tc_id) = setup(ControlMode::Thermostat).await;
        controller.force_running();

        // Default setpoint 107.2C, hyst 0.6: 100C is well below the band.
        let start = Instant::now();
        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(start).await;

        assert!(controller.relay_state());
        assert_eq!(controller.pid_output, 100.0);

        // Hot reading turns it off once min-on elapses.
        controller.inject_reading(tc_id, Some(110.0), false);
        controller.tick(start + std::time::Duration::from_secs(6)).await;
        assert!(!controller.relay_state());
        assert_eq!(controller.pid_output, 0.0);
    }

    #[tokio::test]
    async fn test_boost_overrides_thermostat() {
        let (_store, mut controller, tc_id) = setup(ControlMode::Thermostat).await;
        controller.force_running();

        // Above setpoint the thermostat would hold OFF; boost forces ON.
        controller.enable_boost(Some(60)).await.unwrap();
        controller.inject_reading(tc_id, Some(120.0), false);
        controller.tick(Instant::now()).await;
        assert!(controller.relay_state());

        controller.disable_boost().await.unwrap();
        controller.inject_reading(tc_id, Some(120.0), false);
        controller.tick(Instant::now()).await;
        assert!(!controller.relay_state());
    }

    #[tokio::test]
    async fn test_autotune_preconditions() {
        let (_store, mut controller, _tc) = setup(ControlMode::Thermostat).await;
        let now = Instant::now();

        // Not running.
        let result = controller
            .start_autotune(50.0, 60.0, 0.5, TuningRule::TyreusLuyben, false, now)
            .await;
        assert!(result.is_err());

        // Running but thermostat mode.
        controller.force_running();
        let result = controller
            .start_autotune(50.0, 60.0, 0.5, TuningRule::TyreusLuyben, false, now)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_autotune_lifecycle() {
        let (_store, mut controller, tc_id) = setup(ControlMode::TimeProportional).await;
        controller.force_running();
        let now = Instant::now();

        controller
            .start_autotune(50.0, 60.0, 0.5, TuningRule::ZieglerNicholsPid, false, now)
            .await
            .unwrap();
        assert!(controller.autotune_active());

        // Second start rejected while active.
        assert!(controller
            .start_autotune(50.0, 60.0, 0.5, TuningRule::ZieglerNicholsPid, false, now)
            .await
            .is_err());

        // Tuner output drives the relay while active.
        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(now + std::time::Duration::from_secs(1)).await;
        assert!(controller.relay_state());
        assert_eq!(controller.pid_output, 50.0);

        controller.cancel_autotune().await.unwrap();
        assert!(!controller.autotune_active());
        assert!(controller.apply_autotune_gains().await.is_err());
    }

    #[tokio::test]
    async fn test_set_control_mode_resets_state() {
        let (store, mut controller, tc_id) = setup(ControlMode::TimeProportional).await;
        controller.force_running();

        let start = Instant::now();
        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(start).await;
        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(start + std::time::Duration::from_secs(1)).await;
        assert!(controller.pid_state().integral != 0.0);

        controller
            .set_control_mode(ControlMode::Thermostat)
            .await
            .unwrap();
        assert_eq!(controller.pid_state().integral, 0.0);

        let row = store.get_settings().await.unwrap().unwrap();
        assert_eq!(row.control_mode, "thermostat");
    }

    #[tokio::test]
    async fn test_setpoint_change_persists_both_scales() {
        let (store, mut controller, _tc) = setup(ControlMode::Thermostat).await;

        controller.set_setpoint(250.0).await.unwrap();
        let row = store.get_settings().await.unwrap().unwrap();
        assert_eq!(row.setpoint_f, 250.0);
        assert!((row.setpoint_c - 121.11).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_reading_rows_carry_session_id() {
        let (store, mut controller, tc_id) = setup(ControlMode::Thermostat).await;
        controller.force_running();

        sqlx::query("INSERT INTO smoke (name, started_at, is_active) VALUES ('Ribs', ?, 1)")
            .bind(Utc::now())
            .execute(&store.pool)
            .await
            .unwrap();
        let smoke = store.active_smoke().await.unwrap().unwrap();
        controller.set_active_smoke(smoke.id).await.unwrap();

        controller.inject_reading(tc_id, Some(100.0), false);
        controller.tick(Instant::now()).await;

        let row: (Option<i64>,) = sqlx::query_as("SELECT smoke_id FROM reading LIMIT 1")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.0, Some(smoke.id));
    }

    #[tokio::test]
    async fn test_telemetry_data_shape() {
        let (_store, mut controller, tc_id) = setup(ControlMode::Thermostat).await;
        controller.inject_reading(tc_id, Some(100.0), false);

        let data = controller.telemetry_data().await.unwrap();
        assert!(!data.running);
        assert_eq!(data.control_mode, "thermostat");
        assert_eq!(data.setpoint_f, 225.0);
        assert!(data.thermocouple_readings.contains_key(&tc_id.to_string()));
        assert_eq!(data.alert_summary.count, 0);
    }
}
