//! Heater relay on a GPIO output.
//!
//! The pin is exclusively owned by this driver; reconfiguration releases and
//! re-acquires it. A failed acquisition degrades the driver to simulation so
//! control keeps running while the operator fixes the wiring.

use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, info, warn};

use super::sim::SimRelay;
use super::ProbeError;

enum Backend {
    Gpio(OutputPin),
    Sim(SimRelay),
}

/// Boolean heater output with configurable polarity.
pub struct RelayDriver {
    backend: Backend,
    pin: u8,
    active_high: bool,
    state: bool,
    /// Simulation was requested, as opposed to forced by an init failure.
    sim_requested: bool,
}

impl RelayDriver {
    /// Creates the driver. In hardware mode an acquisition failure logs,
    /// degrades to simulation, and is visible via [`RelayDriver::is_fallback`].
    pub fn new(sim_mode: bool, pin: u8, active_high: bool) -> Self {
        let backend = if sim_mode {
            Backend::Sim(SimRelay::new())
        } else {
            match Self::acquire(pin, active_high) {
                Ok(output) => {
                    info!("GPIO relay initialized on pin {pin}, active_high={active_high}");
                    Backend::Gpio(output)
                }
                Err(e) => {
                    warn!("GPIO relay init failed on pin {pin}: {e}; degrading to simulation");
                    Backend::Sim(SimRelay::new())
                }
            }
        };

        Self {
            backend,
            pin,
            active_high,
            state: false,
            sim_requested: sim_mode,
        }
    }

    fn acquire(pin: u8, active_high: bool) -> Result<OutputPin, ProbeError> {
        let gpio = Gpio::new().map_err(|e| ProbeError::Init(e.to_string()))?;
        let mut output = gpio
            .get(pin)
            .map_err(|e| ProbeError::Init(e.to_string()))?
            .into_output();

        // Start de-energized whatever the polarity.
        if active_high {
            output.set_low();
        } else {
            output.set_high();
        }
        Ok(output)
    }

    /// Commands the relay. Transitions are logged; identical states are
    /// idempotent.
    pub fn set_state(&mut self, state: bool) {
        match &mut self.backend {
            Backend::Gpio(output) => {
                let level_high = state == self.active_high;
                if level_high {
                    output.set_high();
                } else {
                    output.set_low();
                }
                if state != self.state {
                    debug!("Relay {}", if state { "ON" } else { "OFF" });
                }
            }
            Backend::Sim(sim) => sim.set_state(state),
        }
        self.state = state;
    }

    pub fn current_state(&self) -> bool {
        self.state
    }

    /// Releases the active pin and re-acquires with new settings. Usable at
    /// runtime; in simulation only the recorded settings change.
    pub fn reinitialize(&mut self, pin: u8, active_high: bool) {
        self.pin = pin;
        self.active_high = active_high;

        if self.sim_requested {
            info!("Sim mode active; relay settings recorded but not applied (pin={pin})");
            return;
        }

        // Drop the old pin first so re-acquiring the same number works.
        self.backend = Backend::Sim(SimRelay::new());
        self.backend = match Self::acquire(pin, active_high) {
            Ok(output) => {
                info!("Relay reconfigured: pin={pin}, active_high={active_high}");
                Backend::Gpio(output)
            }
            Err(e) => {
                warn!("Relay reconfiguration failed on pin {pin}: {e}; degrading to simulation");
                Backend::Sim(SimRelay::new())
            }
        };

        let state = self.state;
        self.set_state(state);
    }

    /// True when hardware was requested but the driver runs on the
    /// simulator.
    pub fn is_fallback(&self) -> bool {
        !self.sim_requested && matches!(self.backend, Backend::Sim(_))
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn active_high(&self) -> bool {
        self.active_high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_relay_driver_round_trip() {
        let mut driver = RelayDriver::new(true, 17, false);
        assert!(!driver.current_state());
        assert!(!driver.is_fallback());

        driver.set_state(true);
        assert!(driver.current_state());

        driver.set_state(false);
        assert!(!driver.current_state());
    }

    #[test]
    fn test_sim_reinitialize_records_settings() {
        let mut driver = RelayDriver::new(true, 17, false);
        driver.set_state(true);

        driver.reinitialize(27, true);
        assert_eq!(driver.pin(), 27);
        assert!(driver.active_high());
        // State survives reconfiguration.
        assert!(driver.current_state());
    }
}
