//! Discrete PID controller with anti-windup and bumpless transfer.

use std::time::Instant;

use serde::Serialize;

/// Discrete PID law. Sample time is taken from wall-clock deltas between
/// invocations; the first invocation primes timing state and returns the
/// previous output.
#[derive(Debug, Clone)]
pub struct Pid {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    output_min: f64,
    output_max: f64,
    integral_limit: f64,

    last_error: f64,
    integral: f64,
    last_instant: Option<Instant>,
    last_output: f64,

    // Bumpless transfer tracking
    last_setpoint: Option<f64>,
    last_gains: Option<(f64, f64, f64)>,
}

/// Internal state exposed for status display.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub last_error: f64,
    pub integral: f64,
    pub last_output: f64,
    pub output_min: f64,
    pub output_max: f64,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self::with_limits(kp, ki, kd, 0.0, 100.0, 100.0)
    }

    pub fn with_limits(
        kp: f64,
        ki: f64,
        kd: f64,
        output_min: f64,
        output_max: f64,
        integral_limit: f64,
    ) -> Self {
        Self {
            kp,
            ki,
            kd,
            output_min,
            output_max,
            integral_limit,
            last_error: 0.0,
            integral: 0.0,
            last_instant: None,
            last_output: 0.0,
            last_setpoint: None,
            last_gains: None,
        }
    }

    /// Computes the control output for the current wall-clock instant.
    pub fn compute(&mut self, setpoint: f64, current_value: f64) -> f64 {
        let now = Instant::now();
        let dt = match self.last_instant {
            None => {
                self.last_instant = Some(now);
                self.last_setpoint = Some(setpoint);
                self.last_gains = Some((self.kp, self.ki, self.kd));
                return self.last_output;
            }
            Some(last) => now.duration_since(last).as_secs_f64(),
        };
        self.last_instant = Some(now);

        if dt <= 0.0 {
            return self.last_output;
        }

        self.step(setpoint, current_value, dt)
    }

    /// One PID step with an explicit sample time. `compute` delegates here;
    /// tests drive this directly.
    pub fn step(&mut self, setpoint: f64, current_value: f64, dt: f64) -> f64 {
        let error = setpoint - current_value;

        // Re-seed the integrator when the setpoint or gains changed so the
        // output stays continuous across the edit.
        let gains = (self.kp, self.ki, self.kd);
        if self.last_setpoint != Some(setpoint) || self.last_gains != Some(gains) {
            self.bumpless_transfer(error, dt);
            self.last_setpoint = Some(setpoint);
            self.last_gains = Some(gains);
        }

        let proportional = self.kp * error;

        self.integral += error * dt;
        self.integral = self
            .integral
            .clamp(-self.integral_limit, self.integral_limit);
        let integral = self.ki * self.integral;

        let derivative = self.kd * (error - self.last_error) / dt;

        let output = (proportional + integral + derivative).clamp(self.output_min, self.output_max);

        self.last_error = error;
        self.last_output = output;
        output
    }

    fn bumpless_transfer(&mut self, error: f64, dt: f64) {
        let new_proportional = self.kp * error;
        let new_derivative = if self.last_error != 0.0 {
            self.kd * (error - self.last_error) / dt
        } else {
            0.0
        };

        let desired_integral = self.last_output - new_proportional - new_derivative;
        self.integral = if self.ki != 0.0 {
            desired_integral / self.ki
        } else {
            0.0
        };
        self.integral = self
            .integral
            .clamp(-self.integral_limit, self.integral_limit);
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Zeros integrator, previous error, timing state, and last output.
    pub fn reset(&mut self) {
        self.last_error = 0.0;
        self.integral = 0.0;
        self.last_instant = None;
        self.last_output = 0.0;
        self.last_setpoint = None;
        self.last_gains = None;
    }

    pub fn state(&self) -> PidState {
        PidState {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            last_error: self.last_error,
            integral: self.integral,
            last_output: self.last_output,
            output_min: self.output_min,
            output_max: self.output_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_only() {
        let mut pid = Pid::new(1.0, 0.0, 0.0);
        // error = 50, but integral advances error*dt with ki=0 contributing 0
        let out = pid.step(100.0, 50.0, 1.0);
        assert_eq!(out, 50.0);
    }

    #[test]
    fn test_integral_windup_clamped() {
        let mut pid = Pid::with_limits(1.0, 1.0, 0.0, 0.0, 1000.0, 10.0);
        for _ in 0..10 {
            pid.step(100.0, 0.0, 1.0);
        }
        assert!(pid.state().integral.abs() <= 10.0);
    }

    #[test]
    fn test_output_clamped() {
        let mut pid = Pid::with_limits(10.0, 0.0, 0.0, 0.0, 50.0, 100.0);
        let out = pid.step(100.0, 0.0, 1.0);
        assert_eq!(out, 50.0);

        let out = pid.step(0.0, 100.0, 1.0);
        assert_eq!(out, 0.0);
    }

    #[test]
    fn test_derivative_responds_to_error_rate() {
        let mut pid = Pid::new(0.0, 0.0, 1.0);
        let out1 = pid.step(100.0, 50.0, 1.0);
        // Same error, derivative term goes to zero
        let out2 = pid.step(100.0, 50.0, 1.0);
        assert!(out1 > out2);
        // Error shrinks, derivative goes negative, clamped at output_min
        let out3 = pid.step(100.0, 60.0, 1.0);
        assert_eq!(out3, 0.0);
    }

    #[test]
    fn test_bumpless_transfer_on_gain_change() {
        let mut pid = Pid::new(1.0, 0.5, 0.0);
        pid.step(100.0, 90.0, 1.0);
        let before = pid.step(100.0, 90.0, 1.0);

        // Doubling Kp would double the P term; the integrator re-seed must
        // absorb it so the output only moves by the fresh integral step.
        pid.set_gains(2.0, 0.5, 0.0);
        let after = pid.step(100.0, 90.0, 1.0);
        let integral_step = 0.5 * 10.0 * 1.0;
        assert!((after - before - integral_step).abs() < 1e-9);
    }

    #[test]
    fn test_bumpless_transfer_on_setpoint_change() {
        let mut pid = Pid::new(2.0, 0.5, 0.0);
        pid.step(100.0, 90.0, 1.0);
        let before = pid.step(100.0, 90.0, 1.0);

        // The re-seed absorbs the setpoint jump; only the fresh integral
        // step (against the new error) moves the output.
        let after = pid.step(110.0, 90.0, 1.0);
        let integral_step = 0.5 * 20.0 * 1.0;
        assert!((after - before - integral_step).abs() < 1e-9);
    }

    #[test]
    fn test_bumpless_with_zero_ki_zeroes_integral() {
        let mut pid = Pid::new(1.0, 0.5, 0.0);
        pid.step(100.0, 90.0, 1.0);
        assert!(pid.state().integral != 0.0);

        pid.set_gains(1.0, 0.0, 0.0);
        pid.step(100.0, 90.0, 1.0);
        // Integral was re-seeded to zero, then advanced by error*dt with no
        // output contribution (ki = 0).
        assert_eq!(pid.state().integral, 10.0);
        assert_eq!(pid.state().last_output, 10.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pid = Pid::new(1.0, 1.0, 1.0);
        pid.step(100.0, 50.0, 1.0);
        pid.reset();

        let state = pid.state();
        assert_eq!(state.last_error, 0.0);
        assert_eq!(state.integral, 0.0);
        assert_eq!(state.last_output, 0.0);
    }

    #[test]
    fn test_first_compute_primes_without_output() {
        let mut pid = Pid::new(5.0, 0.0, 0.0);
        assert_eq!(pid.compute(100.0, 0.0), 0.0);
    }
}
