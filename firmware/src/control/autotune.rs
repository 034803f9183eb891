//! PID auto-tuner using the relay feedback (Åström–Hägglund) method.
//!
//! A bang-bang relay around the setpoint induces a limit cycle; the cycle's
//! amplitude and period give the ultimate gain Ku and ultimate period Pu,
//! from which the selected tuning rule derives PID gains. Well suited to
//! slow thermal plants like a smoker pit.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Tuning rules applicable once Ku and Pu are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningRule {
    ZieglerNicholsPid,
    ZieglerNicholsPi,
    ZieglerNicholsP,
    TyreusLuyben,
    CianconeMarlin,
    PessenIntegral,
    SomeOvershoot,
    NoOvershoot,
}

impl TuningRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            TuningRule::ZieglerNicholsPid => "ziegler_nichols_pid",
            TuningRule::ZieglerNicholsPi => "ziegler_nichols_pi",
            TuningRule::ZieglerNicholsP => "ziegler_nichols_p",
            TuningRule::TyreusLuyben => "tyreus_luyben",
            TuningRule::CianconeMarlin => "ciancone_marlin",
            TuningRule::PessenIntegral => "pessen_integral",
            TuningRule::SomeOvershoot => "some_overshoot",
            TuningRule::NoOvershoot => "no_overshoot",
        }
    }

    /// Computes (Kp, Ki, Kd) from the ultimate gain and period.
    pub fn gains(&self, ku: f64, pu: f64) -> (f64, f64, f64) {
        match self {
            TuningRule::ZieglerNicholsPid => {
                let kp = 0.6 * ku;
                (kp, 2.0 * kp / pu, kp * pu / 8.0)
            }
            TuningRule::ZieglerNicholsPi => {
                let kp = 0.45 * ku;
                (kp, 1.2 * kp / pu, 0.0)
            }
            TuningRule::ZieglerNicholsP => (0.5 * ku, 0.0, 0.0),
            TuningRule::TyreusLuyben => {
                let kp = 0.45 * ku;
                (kp, 2.2 * kp / pu, kp * pu / 6.3)
            }
            TuningRule::CianconeMarlin => {
                let kp = 0.303 * ku;
                (kp, 0.37 * kp / pu, kp * pu / 1.19)
            }
            TuningRule::PessenIntegral => {
                let kp = 0.7 * ku;
                (kp, 2.5 * kp / pu, 0.15 * kp * pu)
            }
            TuningRule::SomeOvershoot => {
                let kp = 0.33 * ku;
                (kp, 2.0 * kp / pu, kp * pu / 3.0)
            }
            TuningRule::NoOvershoot => {
                let kp = 0.2 * ku;
                (kp, 2.0 * kp / pu, kp * pu / 3.0)
            }
        }
    }
}

/// Auto-tuner state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoTuneState {
    Idle,
    RelayStepUp,
    RelayStepDown,
    Converging,
    Succeeded,
    Failed,
}

impl AutoTuneState {
    /// Terminal states hold their output and never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AutoTuneState::Succeeded | AutoTuneState::Failed)
    }
}

/// Parameters for one auto-tune run.
#[derive(Debug, Clone)]
pub struct AutoTuneConfig {
    /// Target temperature to oscillate around (°C).
    pub setpoint_c: f64,
    /// Relay step as percent of output range, in (0, 100].
    pub output_step: f64,
    /// Window of retained samples (seconds).
    pub lookback_seconds: f64,
    /// Band around the setpoint ignored as noise (°C).
    pub noise_band_c: f64,
    /// Expected sample time (seconds).
    pub sample_time: f64,
    pub tuning_rule: TuningRule,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        Self {
            setpoint_c: 107.2,
            output_step: 50.0,
            lookback_seconds: 60.0,
            noise_band_c: 0.5,
            sample_time: 1.0,
            tuning_rule: TuningRule::TyreusLuyben,
        }
    }
}

/// Computed tuning results.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AutoTuneResults {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub ku: f64,
    pub pu: f64,
}

/// Status snapshot for telemetry and the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AutoTuneStatus {
    pub state: AutoTuneState,
    pub elapsed_time: f64,
    pub cycle_count: u32,
    pub peak_count: u32,
    pub min_cycles: u32,
    pub output: f64,
    pub setpoint: f64,
    pub tuning_rule: TuningRule,
    pub results: Option<AutoTuneResults>,
}

const MIN_CYCLES: u32 = 3;
const MAX_TIME: Duration = Duration::from_secs(30 * 60);

/// Relay-feedback auto-tuner.
pub struct AutoTuner {
    config: AutoTuneConfig,
    state: AutoTuneState,
    output: f64,

    samples: Vec<(Instant, f64)>,
    peaks: Vec<(Instant, f64)>,
    peak_is_max: Vec<bool>,

    results: Option<AutoTuneResults>,

    start_time: Option<Instant>,
    cycle_count: u32,
}

impl AutoTuner {
    pub fn new(config: AutoTuneConfig) -> Self {
        info!(
            "Auto-tuner created: setpoint={:.1}C step={:.0}% rule={}",
            config.setpoint_c,
            config.output_step,
            config.tuning_rule.as_str()
        );
        Self {
            config,
            state: AutoTuneState::Idle,
            output: 0.0,
            samples: Vec::new(),
            peaks: Vec::new(),
            peak_is_max: Vec::new(),
            results: None,
            start_time: None,
            cycle_count: 0,
        }
    }

    /// Begins the relay sequence. Returns false if a run is already in
    /// progress or finished.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.state != AutoTuneState::Idle {
            warn!("Cannot start auto-tune in state {:?}", self.state);
            return false;
        }

        self.samples.clear();
        self.peaks.clear();
        self.peak_is_max.clear();
        self.results = None;
        self.cycle_count = 0;

        self.start_time = Some(now);
        self.state = AutoTuneState::RelayStepUp;
        self.output = self.config.output_step;
        info!("Auto-tune started");
        true
    }

    /// Aborts the run. The next tick sees output 0 and a failed state.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() && self.state != AutoTuneState::Idle {
            info!("Auto-tune cancelled");
            self.state = AutoTuneState::Failed;
            self.output = 0.0;
        }
    }

    /// Marks the run failed due to a hard sensor fault.
    pub fn fail_on_sensor_fault(&mut self) {
        if !self.state.is_terminal() && self.state != AutoTuneState::Idle {
            warn!("Auto-tune failed: control sensor fault");
            self.state = AutoTuneState::Failed;
            self.output = 0.0;
        }
    }

    /// Feeds one measurement and returns `(output_percent, is_complete)`.
    pub fn update(&mut self, current_value: f64, now: Instant) -> (f64, bool) {
        if self.state == AutoTuneState::Idle || self.state.is_terminal() {
            return (self.output, self.state.is_terminal());
        }

        let start = match self.start_time {
            Some(s) => s,
            None => return (self.output, false),
        };

        if now.duration_since(start) > MAX_TIME {
            warn!(
                "Auto-tune timeout after {} minutes",
                MAX_TIME.as_secs() / 60
            );
            self.state = AutoTuneState::Failed;
            self.output = 0.0;
            return (self.output, true);
        }

        self.samples.push((now, current_value));
        let lookback = Duration::from_secs_f64(self.config.lookback_seconds);
        self.samples
            .retain(|(t, _)| now.duration_since(*t) <= lookback);

        if self.samples.len() < 2 {
            return (self.output, false);
        }

        let hi = self.config.setpoint_c + self.config.noise_band_c;
        let lo = self.config.setpoint_c - self.config.noise_band_c;

        match self.state {
            AutoTuneState::RelayStepUp => {
                if current_value > hi {
                    self.state = AutoTuneState::RelayStepDown;
                    self.output = 0.0;
                    self.record_peak(now, current_value, true, start);
                }
            }
            AutoTuneState::RelayStepDown => {
                if current_value < lo {
                    self.state = AutoTuneState::RelayStepUp;
                    self.output = self.config.output_step;
                    self.record_peak(now, current_value, false, start);
                    self.cycle_count += 1;

                    if self.cycle_count >= MIN_CYCLES {
                        self.state = AutoTuneState::Converging;
                        if self.try_compute_gains() {
                            info!("Auto-tune succeeded");
                            self.state = AutoTuneState::Succeeded;
                            self.output = 0.0;
                            return (self.output, true);
                        }
                        // Not enough signal yet; keep cycling.
                        self.state = AutoTuneState::RelayStepUp;
                    }
                }
            }
            _ => {}
        }

        (self.output, false)
    }

    fn record_peak(&mut self, at: Instant, value: f64, is_max: bool, start: Instant) {
        self.peaks.push((at, value));
        self.peak_is_max.push(is_max);
        debug!(
            "Peak {}: {:.2}C at t={:.1}s",
            if is_max { "MAX" } else { "MIN" },
            value,
            at.duration_since(start).as_secs_f64()
        );
    }

    fn try_compute_gains(&mut self) -> bool {
        if self.peaks.len() < (MIN_CYCLES * 2) as usize {
            return false;
        }

        // Ultimate period: mean spacing between same-type peaks.
        let mut periods = Vec::new();
        let mut i = 2;
        while i < self.peaks.len() {
            periods.push(
                self.peaks[i]
                    .0
                    .duration_since(self.peaks[i - 2].0)
                    .as_secs_f64(),
            );
            i += 2;
        }
        if periods.is_empty() {
            return false;
        }
        let pu = periods.iter().sum::<f64>() / periods.len() as f64;

        // Amplitude: mean swing between consecutive opposite peaks.
        let mut amplitudes = Vec::new();
        for i in 1..self.peaks.len() {
            if self.peak_is_max[i] != self.peak_is_max[i - 1] {
                amplitudes.push((self.peaks[i].1 - self.peaks[i - 1].1).abs());
            }
        }
        if amplitudes.is_empty() {
            return false;
        }
        let amplitude = amplitudes.iter().sum::<f64>() / amplitudes.len() as f64;
        if amplitude <= 0.0 {
            return false;
        }

        let ku = (4.0 * self.config.output_step) / (PI * amplitude);
        let (kp, ki, kd) = self.config.tuning_rule.gains(ku, pu);

        info!(
            "Auto-tune results: Ku={:.4} Pu={:.2}s Kp={:.4} Ki={:.4} Kd={:.4}",
            ku, pu, kp, ki, kd
        );

        self.results = Some(AutoTuneResults { kp, ki, kd, ku, pu });
        true
    }

    pub fn state(&self) -> AutoTuneState {
        self.state
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    /// Gains are only available after a successful run.
    pub fn gains(&self) -> Option<(f64, f64, f64)> {
        if self.state != AutoTuneState::Succeeded {
            return None;
        }
        self.results.map(|r| (r.kp, r.ki, r.kd))
    }

    pub fn status(&self, now: Instant) -> AutoTuneStatus {
        AutoTuneStatus {
            state: self.state,
            elapsed_time: self
                .start_time
                .map(|s| now.duration_since(s).as_secs_f64())
                .unwrap_or(0.0),
            cycle_count: self.cycle_count,
            peak_count: self.peaks.len() as u32,
            min_cycles: MIN_CYCLES,
            output: self.output,
            setpoint: self.config.setpoint_c,
            tuning_rule: self.config.tuning_rule,
            results: if self.state == AutoTuneState::Succeeded {
                self.results
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(setpoint: f64, step: f64, rule: TuningRule) -> AutoTuneConfig {
        AutoTuneConfig {
            setpoint_c: setpoint,
            output_step: step,
            lookback_seconds: 600.0,
            noise_band_c: 0.5,
            sample_time: 1.0,
            tuning_rule: rule,
        }
    }

    /// Drives the tuner with an oscillation of period 120 s whose band
    /// crossings land `swing/2` away from the setpoint, so the recorded
    /// peak-to-peak swing is exactly `swing`. Returns the tuner.
    fn run_oscillation(swing: f64, step: f64, rule: TuningRule) -> AutoTuner {
        let setpoint = 100.0;
        let mut tuner = AutoTuner::new(config(setpoint, step, rule));
        let start = Instant::now();
        assert!(tuner.start(start));

        for t in 0..400u64 {
            // Excursions past the noise band at t = 30, 90, 150, ... give
            // alternating peaks 120 s apart per type.
            let temp = match t % 120 {
                30 => setpoint + swing / 2.0,
                90 => setpoint - swing / 2.0,
                _ => setpoint,
            };
            let now = start + Duration::from_secs(t);
            let (_, complete) = tuner.update(temp, now);
            if complete {
                break;
            }
        }
        tuner
    }

    #[test]
    fn test_oscillation_yields_zn_pid_gains() {
        // swing 3°C, period 120 s, step 50 %:
        // Ku = 4*50/(pi*3) ≈ 21.22, Kp = 12.73, Ki = 0.212, Kd = 191.0
        let tuner = run_oscillation(3.0, 50.0, TuningRule::ZieglerNicholsPid);
        assert_eq!(tuner.state(), AutoTuneState::Succeeded);

        let (kp, ki, kd) = tuner.gains().unwrap();
        assert!((kp - 12.73).abs() / 12.73 < 0.01, "kp = {kp}");
        assert!((ki - 0.2122).abs() / 0.2122 < 0.01, "ki = {ki}");
        assert!((kd - 190.99).abs() / 190.99 < 0.01, "kd = {kd}");
        assert_eq!(tuner.output(), 0.0);
    }

    #[test]
    fn test_relay_flips_at_noise_band() {
        let mut tuner = AutoTuner::new(config(100.0, 40.0, TuningRule::TyreusLuyben));
        let start = Instant::now();
        tuner.start(start);
        assert_eq!(tuner.state(), AutoTuneState::RelayStepUp);
        assert_eq!(tuner.output(), 40.0);

        // Within the noise band nothing happens.
        tuner.update(100.2, start + Duration::from_secs(1));
        tuner.update(100.4, start + Duration::from_secs(2));
        assert_eq!(tuner.state(), AutoTuneState::RelayStepUp);

        // Crossing setpoint + band flips the relay down.
        tuner.update(100.6, start + Duration::from_secs(3));
        assert_eq!(tuner.state(), AutoTuneState::RelayStepDown);
        assert_eq!(tuner.output(), 0.0);

        // Crossing setpoint - band flips back up and counts a cycle.
        tuner.update(99.4, start + Duration::from_secs(10));
        assert_eq!(tuner.state(), AutoTuneState::RelayStepUp);
        assert_eq!(tuner.output(), 40.0);
    }

    #[test]
    fn test_cancel_restores_zero_output() {
        let mut tuner = AutoTuner::new(config(100.0, 50.0, TuningRule::TyreusLuyben));
        let start = Instant::now();
        tuner.start(start);
        tuner.update(99.0, start + Duration::from_secs(1));

        tuner.cancel();
        assert_eq!(tuner.state(), AutoTuneState::Failed);
        assert_eq!(tuner.output(), 0.0);
        assert!(tuner.gains().is_none());

        let (out, complete) = tuner.update(99.0, start + Duration::from_secs(2));
        assert_eq!(out, 0.0);
        assert!(complete);
    }

    #[test]
    fn test_timeout_fails_run() {
        let mut tuner = AutoTuner::new(config(100.0, 50.0, TuningRule::TyreusLuyben));
        let start = Instant::now();
        tuner.start(start);
        tuner.update(99.0, start + Duration::from_secs(1));

        let (out, complete) = tuner.update(99.0, start + Duration::from_secs(31 * 60));
        assert!(complete);
        assert_eq!(out, 0.0);
        assert_eq!(tuner.state(), AutoTuneState::Failed);
    }

    #[test]
    fn test_sensor_fault_fails_run() {
        let mut tuner = AutoTuner::new(config(100.0, 50.0, TuningRule::TyreusLuyben));
        tuner.start(Instant::now());
        tuner.fail_on_sensor_fault();
        assert_eq!(tuner.state(), AutoTuneState::Failed);
        assert!(tuner.gains().is_none());
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut tuner = AutoTuner::new(AutoTuneConfig::default());
        let now = Instant::now();
        assert!(tuner.start(now));
        assert!(!tuner.start(now));
    }

    #[test]
    fn test_all_rules_produce_finite_gains() {
        for rule in [
            TuningRule::ZieglerNicholsPid,
            TuningRule::ZieglerNicholsPi,
            TuningRule::ZieglerNicholsP,
            TuningRule::TyreusLuyben,
            TuningRule::CianconeMarlin,
            TuningRule::PessenIntegral,
            TuningRule::SomeOvershoot,
            TuningRule::NoOvershoot,
        ] {
            let (kp, ki, kd) = rule.gains(20.0, 120.0);
            assert!(kp.is_finite() && kp > 0.0);
            assert!(ki.is_finite() && ki >= 0.0);
            assert!(kd.is_finite() && kd >= 0.0);
        }
    }

    #[test]
    fn test_pi_and_p_rules_zero_unused_terms() {
        let (_, ki, kd) = TuningRule::ZieglerNicholsP.gains(20.0, 120.0);
        assert_eq!(ki, 0.0);
        assert_eq!(kd, 0.0);

        let (_, ki, kd) = TuningRule::ZieglerNicholsPi.gains(20.0, 120.0);
        assert!(ki > 0.0);
        assert_eq!(kd, 0.0);
    }
}
