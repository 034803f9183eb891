//! # Hardware Abstraction Layer
//!
//! Uniform interfaces to the physical pit hardware, with simulators standing
//! in whenever the real devices are absent or fail to initialize.
//!
//! ## Module Organization
//!
//! - **max31855**: K-type thermocouple converter on SPI
//! - **relay**: heater relay on a GPIO output
//! - **sim**: simulated probe and relay for development and fallback
//! - **filter**: per-channel filtering pipeline (median, outlier rejection,
//!   double-read verification)

pub mod filter;
pub mod max31855;
pub mod relay;
pub mod sim;

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use protocol::ChannelMode;
use tracing::{info, warn};

use crate::db::Thermocouple;
pub use filter::FilteredChannel;
pub use max31855::Max31855Probe;
pub use relay::RelayDriver;
pub use sim::{SimProbe, SIM_AMBIENT_C};

/// Causes for a rejected raw sample.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("thermocouple open circuit")]
    OpenCircuit,

    #[error("thermocouple shorted to ground")]
    ShortToGround,

    #[error("thermocouple shorted to VCC")]
    ShortToVcc,

    #[error("reading {0} outside plausible range")]
    OutOfRange(f64),

    #[error("reading is not finite")]
    NonFinite,

    #[error("SPI transfer failed: {0}")]
    Spi(String),

    #[error("device init failed: {0}")]
    Init(String),
}

/// A raw temperature source: one hardware chip or one simulator.
#[async_trait]
pub trait ProbeSource: Send {
    /// Takes one raw sample in Celsius.
    async fn sample(&mut self) -> Result<f64, ProbeError>;

    fn mode(&self) -> ChannelMode;

    /// Simulators track the setpoint so their walk converges; hardware
    /// ignores this.
    fn set_setpoint(&mut self, _setpoint_c: f64) {}
}

/// Owns every enabled thermocouple channel and its filtering pipeline.
pub struct SensorManager {
    sim_mode: bool,
    channels: HashMap<i64, FilteredChannel>,
}

impl SensorManager {
    pub fn new(sim_mode: bool) -> Self {
        info!("Sensor manager created (sim_mode={sim_mode})");
        Self {
            sim_mode,
            channels: HashMap::new(),
        }
    }

    /// Registers a channel. In hardware mode a failed chip init falls back
    /// to a simulator; the caller can see this through
    /// [`SensorManager::has_fallback`].
    pub fn add_channel(&mut self, tc: &Thermocouple, setpoint_c: f64) {
        let source: Box<dyn ProbeSource> = if self.sim_mode {
            let mut probe = SimProbe::new(SIM_AMBIENT_C + (tc.id as f64) * 5.0);
            probe.set_setpoint(setpoint_c);
            info!("Added simulated probe '{}' (id={})", tc.name, tc.id);
            Box::new(probe)
        } else {
            match Max31855Probe::new(tc.cs_pin as u8) {
                Ok(probe) => {
                    info!(
                        "Added MAX31855 probe '{}' (id={}, cs_pin={})",
                        tc.name, tc.id, tc.cs_pin
                    );
                    Box::new(probe)
                }
                Err(e) => {
                    warn!(
                        "Probe '{}' (cs_pin={}) failed to initialize: {e}; \
                         falling back to simulation",
                        tc.name, tc.cs_pin
                    );
                    let mut probe = SimProbe::new(SIM_AMBIENT_C);
                    probe.set_setpoint(setpoint_c);
                    Box::new(probe)
                }
            }
        };

        self.channels.insert(tc.id, FilteredChannel::new(source));
    }

    pub fn remove_channel(&mut self, id: i64) {
        self.channels.remove(&id);
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Reads every channel through its filter pipeline.
    pub async fn read_all(&mut self, now: Instant) -> HashMap<i64, (Option<f64>, bool)> {
        let mut results = HashMap::new();
        for (id, channel) in self.channels.iter_mut() {
            results.insert(*id, channel.read_filtered(now).await);
        }
        results
    }

    /// Pushes a new setpoint into any simulated sources.
    pub fn update_setpoint(&mut self, setpoint_c: f64) {
        for channel in self.channels.values_mut() {
            channel.source_mut().set_setpoint(setpoint_c);
        }
    }

    /// Per-channel backing mode: real chip or simulator.
    pub fn channel_modes(&self) -> HashMap<i64, ChannelMode> {
        self.channels
            .iter()
            .map(|(id, ch)| (*id, ch.source().mode()))
            .collect()
    }

    /// True when hardware was requested but at least one channel runs on a
    /// simulator.
    pub fn has_fallback(&self) -> bool {
        !self.sim_mode
            && self
                .channels
                .values()
                .any(|ch| ch.source().mode() == ChannelMode::Simulated)
    }
}
