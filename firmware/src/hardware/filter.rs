//! Per-channel sensor filtering pipeline.
//!
//! Raw samples pass through outlier detection, an optional double-read
//! verification, and a median window before anything downstream sees them.
//! A rejected sample never reaches the control law: the channel reports its
//! last good value with the fault flag raised.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::max31855::{PLAUSIBLE_MAX_C, PLAUSIBLE_MIN_C};
use super::ProbeSource;

/// Median window length.
const WINDOW_LEN: usize = 5;
/// Samples needed before the median is reported instead of the candidate.
const MEDIAN_MIN: usize = 3;

/// A candidate is suspect when it jumps more than this from the last
/// accepted sample (8 °F expressed in Celsius degrees).
const SUSPECT_JUMP_C: f64 = 8.0 * 5.0 / 9.0;
/// ...or when the implied rate exceeds this (3 °F/s in Celsius).
const SUSPECT_RATE_C_PER_S: f64 = 3.0 * 5.0 / 9.0;
/// Double-read agreement band (2 °F in Celsius).
const DOUBLE_READ_AGREE_C: f64 = 2.0 * 5.0 / 9.0;
/// Settling delay before the verification read.
const DOUBLE_READ_DELAY: Duration = Duration::from_millis(100);

/// One thermocouple channel with its filter state.
pub struct FilteredChannel {
    source: Box<dyn ProbeSource>,
    window: VecDeque<f64>,
    last_accepted: Option<(Instant, f64)>,
    last_reported: Option<f64>,
    fault_count: u64,
}

impl FilteredChannel {
    pub fn new(source: Box<dyn ProbeSource>) -> Self {
        Self {
            source,
            window: VecDeque::with_capacity(WINDOW_LEN),
            last_accepted: None,
            last_reported: None,
            fault_count: 0,
        }
    }

    /// Reads one filtered sample.
    ///
    /// Returns `(temperature, fault)`. On rejection the temperature is the
    /// last good reading (or `None` if none was ever observed) and `fault`
    /// is true.
    pub async fn read_filtered(&mut self, now: Instant) -> (Option<f64>, bool) {
        let candidate = match self.source.sample().await {
            Ok(value) if plausible(value) => value,
            Ok(value) => {
                warn!("Sample {value:.1}C outside plausible range; rejected");
                return self.reject();
            }
            Err(e) => {
                debug!("Probe fault: {e}");
                return self.reject();
            }
        };

        let candidate = if self.is_suspect(candidate, now) {
            match self.double_read(candidate).await {
                Some(verified) => verified,
                None => return self.reject(),
            }
        } else {
            candidate
        };

        self.accept(candidate, now)
    }

    fn is_suspect(&self, candidate: f64, now: Instant) -> bool {
        let (at, last) = match self.last_accepted {
            Some(pair) => pair,
            None => return false,
        };

        let jump = (candidate - last).abs();
        if jump > SUSPECT_JUMP_C {
            return true;
        }

        let dt = now.duration_since(at).as_secs_f64();
        dt > 0.0 && jump / dt > SUSPECT_RATE_C_PER_S
    }

    /// Verifies a suspect sample with a second read after a short delay.
    /// Returns the averaged value when the reads agree.
    async fn double_read(&mut self, candidate: f64) -> Option<f64> {
        tokio::time::sleep(DOUBLE_READ_DELAY).await;

        let second = match self.source.sample().await {
            Ok(value) if plausible(value) => value,
            _ => {
                warn!("Double-read failed; suspect sample {candidate:.1}C rejected");
                return None;
            }
        };

        if (second - candidate).abs() > DOUBLE_READ_AGREE_C {
            warn!(
                "Double-read disagreement ({candidate:.1}C vs {second:.1}C); sample rejected"
            );
            return None;
        }

        Some((candidate + second) / 2.0)
    }

    fn accept(&mut self, value: f64, now: Instant) -> (Option<f64>, bool) {
        if self.window.len() == WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.last_accepted = Some((now, value));

        let reported = if self.window.len() >= MEDIAN_MIN {
            median(&self.window)
        } else {
            value
        };
        self.last_reported = Some(reported);
        (Some(reported), false)
    }

    fn reject(&mut self) -> (Option<f64>, bool) {
        self.fault_count += 1;
        (self.last_reported, true)
    }

    pub fn fault_count(&self) -> u64 {
        self.fault_count
    }

    pub fn source(&self) -> &dyn ProbeSource {
        self.source.as_ref()
    }

    pub fn source_mut(&mut self) -> &mut dyn ProbeSource {
        self.source.as_mut()
    }
}

fn plausible(value: f64) -> bool {
    value.is_finite() && (PLAUSIBLE_MIN_C..=PLAUSIBLE_MAX_C).contains(&value)
}

fn median(window: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}
