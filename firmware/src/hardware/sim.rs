//! Simulated hardware for development and fallback operation.

use std::time::Instant;

use async_trait::async_trait;
use protocol::ChannelMode;
use rand::Rng;
use tracing::info;

use super::{ProbeError, ProbeSource};

/// Starting temperature for simulated probes (°C).
pub const SIM_AMBIENT_C: f64 = 20.0;

/// Random-walk temperature source that drifts toward the setpoint.
pub struct SimProbe {
    current_temp: f64,
    setpoint: f64,
    noise_c: f64,
    last_update: Option<Instant>,
}

impl SimProbe {
    pub fn new(start_temp_c: f64) -> Self {
        Self {
            current_temp: start_temp_c,
            setpoint: 107.2,
            noise_c: 0.5,
            last_update: None,
        }
    }

    fn advance(&mut self) -> f64 {
        let now = Instant::now();
        let dt = match self.last_update {
            Some(last) => now.duration_since(last).as_secs_f64(),
            None => 0.0,
        };
        self.last_update = Some(now);

        // Slow drift toward the setpoint plus bounded noise.
        let drift = (self.setpoint - self.current_temp) * 0.01 * dt;
        let noise = rand::thread_rng().gen_range(-self.noise_c..=self.noise_c);
        self.current_temp = (self.current_temp + drift + noise).clamp(15.0, 200.0);
        self.current_temp
    }
}

#[async_trait]
impl ProbeSource for SimProbe {
    async fn sample(&mut self) -> Result<f64, ProbeError> {
        Ok(self.advance())
    }

    fn mode(&self) -> ChannelMode {
        ChannelMode::Simulated
    }

    fn set_setpoint(&mut self, setpoint_c: f64) {
        self.setpoint = setpoint_c;
    }
}

/// Relay stand-in that only records and logs transitions.
#[derive(Debug, Default)]
pub struct SimRelay {
    state: bool,
}

impl SimRelay {
    pub fn new() -> Self {
        info!("Simulated relay driver initialized");
        Self { state: false }
    }

    pub fn set_state(&mut self, state: bool) {
        if state != self.state {
            info!("SIM: relay {}", if state { "ON" } else { "OFF" });
            self.state = state;
        }
    }

    pub fn state(&self) -> bool {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sim_probe_stays_bounded() {
        let mut probe = SimProbe::new(SIM_AMBIENT_C);
        probe.set_setpoint(107.2);

        for _ in 0..50 {
            let temp = probe.sample().await.unwrap();
            assert!((15.0..=200.0).contains(&temp));
        }
        assert_eq!(probe.mode(), ChannelMode::Simulated);
    }

    #[test]
    fn test_sim_relay_tracks_state() {
        let mut relay = SimRelay::new();
        assert!(!relay.state());
        relay.set_state(true);
        assert!(relay.state());
        relay.set_state(true);
        assert!(relay.state());
        relay.set_state(false);
        assert!(!relay.state());
    }
}
