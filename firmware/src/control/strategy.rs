//! Relay-intent laws for the two control modes.
//!
//! These are pure state machines fed the clock explicitly so the control
//! loop stays testable without a runtime. The loop owns one of each and
//! resets them on mode changes.

use std::time::Instant;

/// Hysteresis switching decision.
///
/// When OFF, turn ON below `setpoint - hyst`; when ON, stay ON below
/// `setpoint + hyst`. The band keeps the relay from chattering around the
/// setpoint.
pub fn thermostat_intent(currently_on: bool, temp_c: f64, setpoint_c: f64, hyst_c: f64) -> bool {
    if currently_on {
        temp_c < setpoint_c + hyst_c
    } else {
        temp_c < setpoint_c - hyst_c
    }
}

/// Minimum on/off dwell enforcement for thermostat mode.
///
/// Tracks the instants of the last commanded transitions. A requested
/// transition is suppressed until the relay has been in its current state
/// for the configured minimum.
#[derive(Debug, Default)]
pub struct DwellGate {
    last_on: Option<Instant>,
    last_off: Option<Instant>,
}

impl DwellGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies dwell rules to a desired relay state. Returns `Some(state)`
    /// when a transition should be commanded now, `None` to hold.
    pub fn apply(
        &mut self,
        desired: bool,
        relay_state: bool,
        now: Instant,
        min_on_s: f64,
        min_off_s: f64,
    ) -> Option<bool> {
        if desired && !relay_state {
            if let Some(off) = self.last_off {
                if now.duration_since(off).as_secs_f64() < min_off_s {
                    return None;
                }
            }
            self.last_on = Some(now);
            Some(true)
        } else if !desired && relay_state {
            if let Some(on) = self.last_on {
                if now.duration_since(on).as_secs_f64() < min_on_s {
                    return None;
                }
            }
            self.last_off = Some(now);
            Some(false)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.last_on = None;
        self.last_off = None;
    }
}

/// Duty-cycle window for time-proportional mode.
///
/// The PID output (0–100 %) fixes the ON fraction of each window. The ON
/// duration is latched at the start of a window; mid-window output changes
/// take effect at the next window boundary. Dwell is deliberately not
/// applied here: the window length is the only switching rate limit.
#[derive(Debug, Default)]
pub struct DutyWindow {
    window_start: Option<Instant>,
    on_duration_s: f64,
}

impl DutyWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the window and returns the relay intent for this tick.
    pub fn update(&mut self, pid_output: f64, window_s: f64, now: Instant) -> bool {
        let elapsed = match self.window_start {
            Some(start) => now.duration_since(start).as_secs_f64(),
            None => {
                self.begin_window(pid_output, window_s, now);
                0.0
            }
        };

        let elapsed = if elapsed >= window_s {
            self.begin_window(pid_output, window_s, now);
            0.0
        } else {
            elapsed
        };

        elapsed < self.on_duration_s
    }

    fn begin_window(&mut self, pid_output: f64, window_s: f64, now: Instant) {
        self.window_start = Some(now);
        self.on_duration_s = (pid_output / 100.0) * window_s;
    }

    pub fn reset(&mut self) {
        self.window_start = None;
        self.on_duration_s = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hysteresis_band() {
        // OFF: only turns on below setpoint - hyst
        assert!(thermostat_intent(false, 97.9, 100.0, 2.0));
        assert!(!thermostat_intent(false, 98.0, 100.0, 2.0));
        assert!(!thermostat_intent(false, 99.0, 100.0, 2.0));

        // ON: stays on up to setpoint + hyst
        assert!(thermostat_intent(true, 101.9, 100.0, 2.0));
        assert!(!thermostat_intent(true, 102.0, 100.0, 2.0));
    }

    /// Thermostat cycling scenario: setpoint 100, hyst 2, min_on = min_off
    /// = 5 s, temps fed at 1 Hz starting with the relay OFF.
    #[test]
    fn test_thermostat_cycle_with_dwell() {
        let temps = [
            96.0, 97.0, 98.0, 101.0, 102.0, 103.0, 104.0, 99.0, 98.0, 97.0,
        ];
        let start = Instant::now();
        let mut gate = DwellGate::new();
        let mut relay = false;
        let mut output = false;
        let mut states = Vec::new();

        for (i, &temp) in temps.iter().enumerate() {
            let now = start + Duration::from_secs(i as u64);
            output = thermostat_intent(output, temp, 100.0, 2.0);
            if let Some(new_state) = gate.apply(output, relay, now, 5.0, 5.0) {
                relay = new_state;
            }
            states.push(relay);
        }

        // ON at t=0 (96 < 98); held while temp < 102 and through the
        // min-on window; OFF at t=5 (103 >= 102, 5 s elapsed); the t=9
        // request to turn back ON (97 < 98) is blocked by min-off.
        assert_eq!(
            states,
            [true, true, true, true, true, false, false, false, false, false]
        );

        // One second later min-off is satisfied and the relay may close.
        let now = start + Duration::from_secs(10);
        assert_eq!(gate.apply(true, relay, now, 5.0, 5.0), Some(true));
    }

    #[test]
    fn test_dwell_allows_first_transition() {
        let mut gate = DwellGate::new();
        let now = Instant::now();
        // No prior transitions recorded: nothing to wait for.
        assert_eq!(gate.apply(true, false, now, 60.0, 60.0), Some(true));
    }

    #[test]
    fn test_dwell_min_on_blocks_early_off() {
        let mut gate = DwellGate::new();
        let start = Instant::now();
        assert_eq!(gate.apply(true, false, start, 5.0, 5.0), Some(true));

        let t3 = start + Duration::from_secs(3);
        assert_eq!(gate.apply(false, true, t3, 5.0, 5.0), None);

        let t5 = start + Duration::from_secs(5);
        assert_eq!(gate.apply(false, true, t5, 5.0, 5.0), Some(false));
    }

    /// Time-proportional scenario: pid_output 20 % over a 10 s window gives
    /// 2 s ON, 8 s OFF in every window.
    #[test]
    fn test_duty_window_twenty_percent() {
        let start = Instant::now();
        let mut window = DutyWindow::new();
        let mut pattern = Vec::new();

        for i in 0..20u64 {
            let now = start + Duration::from_secs(i);
            pattern.push(window.update(20.0, 10.0, now));
        }

        let expected: Vec<bool> = (0..20).map(|i| i % 10 < 2).collect();
        assert_eq!(pattern, expected);
    }

    #[test]
    fn test_duty_window_extremes() {
        let start = Instant::now();

        let mut window = DutyWindow::new();
        for i in 0..10u64 {
            let now = start + Duration::from_secs(i);
            assert!(!window.update(0.0, 10.0, now));
        }

        let mut window = DutyWindow::new();
        for i in 0..10u64 {
            let now = start + Duration::from_secs(i);
            assert!(window.update(100.0, 10.0, now));
        }
    }

    #[test]
    fn test_duty_window_latches_output_per_window() {
        let start = Instant::now();
        let mut window = DutyWindow::new();

        // 50 % latched at window start.
        assert!(window.update(50.0, 10.0, start));
        // A mid-window output change does not extend the ON phase.
        assert!(window.update(90.0, 10.0, start + Duration::from_secs(4)));
        assert!(!window.update(90.0, 10.0, start + Duration::from_secs(5)));

        // The next window picks up the new output.
        assert!(window.update(90.0, 10.0, start + Duration::from_secs(10)));
        assert!(window.update(90.0, 10.0, start + Duration::from_secs(18)));
        assert!(!window.update(90.0, 10.0, start + Duration::from_secs(19)));
    }
}
