//! Continuous adaptive PID tuning.
//!
//! Watches a rolling window of control error and nudges the live gains in
//! small bounded steps. Only active in time-proportional mode; one
//! adjustment per cooldown window so the plant settles between changes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

/// Tunable limits for the adaptive tuner.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub min_kp: f64,
    pub max_kp: f64,
    pub min_ki: f64,
    pub max_ki: f64,
    pub min_kd: f64,
    pub max_kd: f64,
    /// Maximum fractional change per adjustment (0.05 = 5 %).
    pub adjustment_rate: f64,
    /// Samples held for evaluation (≈ seconds at 1 Hz).
    pub evaluation_window: usize,
    /// Minimum spacing between adjustments.
    pub cooldown: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_kp: 1.0,
            max_kp: 15.0,
            min_ki: 0.01,
            max_ki: 1.0,
            min_kd: 5.0,
            max_kd: 50.0,
            adjustment_rate: 0.05,
            evaluation_window: 300,
            cooldown: Duration::from_secs(600),
        }
    }
}

/// Window metrics driving the adjustment decision.
#[derive(Debug, Clone, Copy)]
struct WindowMetrics {
    avg_error: f64,
    avg_abs_error: f64,
    /// 0–1; zero crossings of the error normalized by window length / 10.
    oscillation_score: f64,
    overshoot_detected: bool,
    /// Index of the last sample with |error| beyond the settled band.
    settling_index: usize,
}

/// A suggested gain change.
#[derive(Debug, Clone)]
pub struct Adjustment {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub reason: String,
}

/// One applied adjustment, kept for status display.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentRecord {
    pub old_kp: f64,
    pub old_ki: f64,
    pub old_kd: f64,
    pub new_kp: f64,
    pub new_ki: f64,
    pub new_kd: f64,
    pub reason: String,
}

/// Status snapshot for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveStatus {
    pub enabled: bool,
    pub adjustment_count: u32,
    pub cooldown_remaining_s: f64,
    pub data_points: usize,
    pub recent_adjustments: Vec<AdjustmentRecord>,
}

const HISTORY_LIMIT: usize = 20;
const SETTLED_BAND_C: f64 = 0.5;
const OVERSHOOT_BAND_C: f64 = 2.0;

/// Rolling-window self-tuner.
pub struct AdaptiveTuner {
    config: AdaptiveConfig,
    enabled: bool,

    errors: VecDeque<f64>,
    temps: VecDeque<f64>,
    setpoints: VecDeque<f64>,

    last_adjustment: Option<Instant>,
    adjustment_count: u32,
    history: Vec<AdjustmentRecord>,
}

impl AdaptiveTuner {
    pub fn new(config: AdaptiveConfig) -> Self {
        let window = config.evaluation_window;
        Self {
            config,
            enabled: false,
            errors: VecDeque::with_capacity(window),
            temps: VecDeque::with_capacity(window),
            setpoints: VecDeque::with_capacity(window),
            last_adjustment: None,
            adjustment_count: 0,
            history: Vec::new(),
        }
    }

    pub fn enable(&mut self) {
        if !self.enabled {
            self.enabled = true;
            info!("Adaptive PID tuning enabled");
        }
    }

    pub fn disable(&mut self) {
        if self.enabled {
            self.enabled = false;
            info!("Adaptive PID tuning disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records one control sample. Ignored while disabled.
    pub fn record_sample(&mut self, temp: f64, setpoint: f64, error: f64) {
        if !self.enabled {
            return;
        }

        if self.errors.len() == self.config.evaluation_window {
            self.errors.pop_front();
            self.temps.pop_front();
            self.setpoints.pop_front();
        }
        self.errors.push_back(error);
        self.temps.push_back(temp);
        self.setpoints.push_back(setpoint);
    }

    fn should_adjust(&self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }

        // Need a mostly full window before judging behaviour.
        let need = (self.config.evaluation_window as f64 * 0.8) as usize;
        if self.errors.len() < need {
            return false;
        }

        match self.last_adjustment {
            Some(last) => now.duration_since(last) >= self.config.cooldown,
            None => true,
        }
    }

    /// Evaluates the window and returns bounded new gains when a rule fires.
    pub fn evaluate_and_adjust(
        &mut self,
        kp: f64,
        ki: f64,
        kd: f64,
        now: Instant,
    ) -> Option<Adjustment> {
        if !self.should_adjust(now) {
            return None;
        }

        let metrics = self.metrics();
        let mut adjustment = self.decide(&metrics, kp, ki, kd)?;

        adjustment.kp = adjustment.kp.clamp(self.config.min_kp, self.config.max_kp);
        adjustment.ki = adjustment.ki.clamp(self.config.min_ki, self.config.max_ki);
        adjustment.kd = adjustment.kd.clamp(self.config.min_kd, self.config.max_kd);

        self.last_adjustment = Some(now);
        self.adjustment_count += 1;

        self.history.push(AdjustmentRecord {
            old_kp: kp,
            old_ki: ki,
            old_kd: kd,
            new_kp: adjustment.kp,
            new_ki: adjustment.ki,
            new_kd: adjustment.kd,
            reason: adjustment.reason.clone(),
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }

        info!(
            "Adaptive adjustment #{}: {} | Kp {:.4}->{:.4} Ki {:.4}->{:.4} Kd {:.4}->{:.4}",
            self.adjustment_count,
            adjustment.reason,
            kp,
            adjustment.kp,
            ki,
            adjustment.ki,
            kd,
            adjustment.kd
        );

        Some(adjustment)
    }

    fn metrics(&self) -> WindowMetrics {
        let n = self.errors.len();

        let avg_error = self.errors.iter().sum::<f64>() / n as f64;
        let avg_abs_error = self.errors.iter().map(|e| e.abs()).sum::<f64>() / n as f64;

        let mut zero_crossings = 0usize;
        for i in 1..n {
            if (self.errors[i] > 0.0) != (self.errors[i - 1] > 0.0) {
                zero_crossings += 1;
            }
        }
        let oscillation_score = (zero_crossings as f64 / (n as f64 * 0.1)).min(1.0);

        let overshoot_detected = self
            .temps
            .iter()
            .zip(self.setpoints.iter())
            .any(|(t, s)| (t - s).abs() > OVERSHOOT_BAND_C);

        let mut settling_index = 0usize;
        for (i, error) in self.errors.iter().enumerate() {
            if error.abs() > SETTLED_BAND_C {
                settling_index = i;
            }
        }

        WindowMetrics {
            avg_error,
            avg_abs_error,
            oscillation_score,
            overshoot_detected,
            settling_index,
        }
    }

    fn decide(&self, m: &WindowMetrics, kp: f64, ki: f64, kd: f64) -> Option<Adjustment> {
        let rate = self.config.adjustment_rate;

        // Priority order: oscillation > overshoot > steady-state bias >
        // sluggish response.
        if m.oscillation_score > 0.6 {
            return Some(Adjustment {
                kp: kp * (1.0 - rate),
                ki,
                kd: kd * (1.0 - rate * 0.5),
                reason: format!("Reducing oscillation (score={:.2})", m.oscillation_score),
            });
        }

        if m.overshoot_detected && kd < self.config.max_kd * 0.9 {
            return Some(Adjustment {
                kp: kp * (1.0 - rate * 0.3),
                ki,
                kd: kd * (1.0 + rate),
                reason: "Increasing damping to reduce overshoot".to_string(),
            });
        }

        if m.avg_error.abs() > 1.0 && ki < self.config.max_ki * 0.9 && m.oscillation_score < 0.3 {
            return Some(Adjustment {
                kp,
                ki: ki * (1.0 + rate * 0.5),
                kd,
                reason: format!("Correcting steady-state error ({:.2}C)", m.avg_error),
            });
        }

        if m.settling_index > 200 && m.avg_abs_error > 1.5 && m.oscillation_score < 0.3 {
            return Some(Adjustment {
                kp: kp * (1.0 + rate),
                ki,
                kd,
                reason: format!(
                    "Increasing responsiveness (settling index={})",
                    m.settling_index
                ),
            });
        }

        if m.avg_abs_error < 0.5 && m.oscillation_score < 0.2 {
            debug!(
                "PID performing well (error={:.2}C, oscillation={:.2})",
                m.avg_abs_error, m.oscillation_score
            );
        }

        None
    }

    pub fn status(&self, now: Instant) -> AdaptiveStatus {
        let cooldown_remaining_s = match self.last_adjustment {
            Some(last) => {
                let elapsed = now.duration_since(last);
                (self.config.cooldown.saturating_sub(elapsed)).as_secs_f64()
            }
            None => 0.0,
        };

        AdaptiveStatus {
            enabled: self.enabled,
            adjustment_count: self.adjustment_count,
            cooldown_remaining_s,
            data_points: self.errors.len(),
            recent_adjustments: self.history.iter().rev().take(5).rev().cloned().collect(),
        }
    }

    /// Drops all buffered samples and the cooldown marker.
    pub fn reset(&mut self) {
        self.errors.clear();
        self.temps.clear();
        self.setpoints.clear();
        self.last_adjustment = None;
    }
}
