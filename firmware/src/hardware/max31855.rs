//! MAX31855 K-type thermocouple converter on SPI.
//!
//! The chip shifts out a 32-bit frame: bits 31:18 carry the 14-bit signed
//! thermocouple temperature (0.25 °C/LSB), bit 16 flags any fault, and bits
//! 2:0 identify the fault cause (SCV, SCG, OC). One chip per channel, each
//! selected by its own chip-select GPIO; the bus itself is shared.

use async_trait::async_trait;
use protocol::ChannelMode;
use rppal::gpio::{Gpio, OutputPin};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use super::{ProbeError, ProbeSource};

const SPI_CLOCK_HZ: u32 = 5_000_000;

/// Plausible pit temperature range; anything outside is a sensor fault.
pub const PLAUSIBLE_MIN_C: f64 = -50.0;
pub const PLAUSIBLE_MAX_C: f64 = 500.0;

/// One MAX31855 behind a dedicated chip-select pin.
pub struct Max31855Probe {
    spi: Spi,
    cs: OutputPin,
}

impl Max31855Probe {
    /// Acquires the SPI bus and the chip-select GPIO. Failure here means the
    /// channel falls back to simulation.
    pub fn new(cs_pin: u8) -> Result<Self, ProbeError> {
        let gpio = Gpio::new().map_err(|e| ProbeError::Init(e.to_string()))?;
        let cs = gpio
            .get(cs_pin)
            .map_err(|e| ProbeError::Init(e.to_string()))?
            .into_output_high();

        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0)
            .map_err(|e| ProbeError::Init(e.to_string()))?;

        Ok(Self { spi, cs })
    }

    fn read_frame(&mut self) -> Result<u32, ProbeError> {
        let mut buf = [0u8; 4];

        self.cs.set_low();
        let result = self.spi.read(&mut buf);
        self.cs.set_high();

        result.map_err(|e| ProbeError::Spi(e.to_string()))?;
        Ok(u32::from_be_bytes(buf))
    }
}

#[async_trait]
impl ProbeSource for Max31855Probe {
    async fn sample(&mut self) -> Result<f64, ProbeError> {
        let frame = self.read_frame()?;
        decode_frame(frame)
    }

    fn mode(&self) -> ChannelMode {
        ChannelMode::Real
    }
}

/// Decodes one 32-bit MAX31855 frame into Celsius, surfacing the chip's
/// fault bits and rejecting implausible values.
pub fn decode_frame(frame: u32) -> Result<f64, ProbeError> {
    if frame & 0x0001_0000 != 0 {
        if frame & 0x0000_0001 != 0 {
            return Err(ProbeError::OpenCircuit);
        }
        if frame & 0x0000_0002 != 0 {
            return Err(ProbeError::ShortToGround);
        }
        if frame & 0x0000_0004 != 0 {
            return Err(ProbeError::ShortToVcc);
        }
        // Fault flag without a cause bit: treat as an open circuit.
        return Err(ProbeError::OpenCircuit);
    }

    // 14-bit signed value in bits 31:18.
    let mut counts = ((frame >> 18) & 0x3FFF) as i32;
    if counts & 0x2000 != 0 {
        counts -= 0x4000;
    }
    let temp_c = counts as f64 * 0.25;

    if !temp_c.is_finite() {
        return Err(ProbeError::NonFinite);
    }
    if !(PLAUSIBLE_MIN_C..=PLAUSIBLE_MAX_C).contains(&temp_c) {
        return Err(ProbeError::OutOfRange(temp_c));
    }

    Ok(temp_c)
}
