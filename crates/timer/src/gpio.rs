//! Digital outputs driving the valve relays. The `gpio` feature gates the
//! real rppal driver; without it, a mock board records pin levels and logs
//! every write.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PinLevel {
    Low,
    High,
}

/// Level that energizes (`on = true`) or releases a relay.
pub fn level_for(on: bool, active_low: bool) -> PinLevel {
    match (on, active_low) {
        (true, true) | (false, false) => PinLevel::Low,
        (true, false) | (false, true) => PinLevel::High,
    }
}

// ---------------------------------------------------------------------------
// Real GPIO board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct PinBoard {
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl PinBoard {
    pub fn new(active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open GPIO")?;
        tracing::info!(active_low, "GPIO initialised");
        Ok(Self {
            gpio,
            pins: HashMap::new(),
            active_low,
        })
    }

    /// Claim `pin` as an output, released (device off) from the start.
    pub fn configure(&mut self, pin: u8) -> Result<()> {
        let mut out = self
            .gpio
            .get(pin)
            .with_context(|| format!("failed to claim gpio {pin}"))?
            .into_output();
        // Fail-safe: relay released before anything else happens.
        match level_for(false, self.active_low) {
            PinLevel::High => out.set_high(),
            PinLevel::Low => out.set_low(),
        }
        self.pins.insert(pin, out);
        Ok(())
    }

    pub fn write(&mut self, pin: u8, level: PinLevel) -> Result<()> {
        let out = self
            .pins
            .get_mut(&pin)
            .with_context(|| format!("gpio {pin} was never configured"))?;
        match level {
            PinLevel::High => out.set_high(),
            PinLevel::Low => out.set_low(),
        }
        tracing::debug!(pin, ?level, "gpio write");
        Ok(())
    }

    pub fn active_low(&self) -> bool {
        self.active_low
    }
}

// ---------------------------------------------------------------------------
// Mock board (development, no hardware, records levels)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct PinBoard {
    pins: HashMap<u8, PinLevel>,
    active_low: bool,
}

#[cfg(not(feature = "gpio"))]
impl PinBoard {
    pub fn new(active_low: bool) -> Result<Self> {
        tracing::info!(active_low, "[mock-gpio] board initialised (no hardware)");
        Ok(Self {
            pins: HashMap::new(),
            active_low,
        })
    }

    pub fn configure(&mut self, pin: u8) -> Result<()> {
        let level = level_for(false, self.active_low);
        tracing::info!(pin, ?level, "[mock-gpio] configured output");
        self.pins.insert(pin, level);
        Ok(())
    }

    pub fn write(&mut self, pin: u8, level: PinLevel) -> Result<()> {
        match self.pins.get_mut(&pin) {
            Some(current) => {
                *current = level;
                tracing::info!(pin, ?level, "[mock-gpio] write");
                Ok(())
            }
            None => anyhow::bail!("gpio {pin} was never configured"),
        }
    }

    pub fn active_low(&self) -> bool {
        self.active_low
    }

    /// Last level written to `pin`.
    pub fn level(&self, pin: u8) -> Option<PinLevel> {
        self.pins.get(&pin).copied()
    }
}

// Shared helpers
impl PinBoard {
    /// Drive `pin` so its relay is energized (`true`) or released.
    pub fn set_energized(&mut self, pin: u8, on: bool) -> Result<()> {
        let level = level_for(on, self.active_low());
        self.write(pin, level)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn active_low_energizes_on_low() {
        assert_eq!(level_for(true, true), PinLevel::Low);
        assert_eq!(level_for(false, true), PinLevel::High);
    }

    #[test]
    fn active_high_energizes_on_high() {
        assert_eq!(level_for(true, false), PinLevel::High);
        assert_eq!(level_for(false, false), PinLevel::Low);
    }

    #[test]
    fn configure_starts_released() {
        let mut board = PinBoard::new(true).unwrap();
        board.configure(18).unwrap();
        assert_eq!(board.level(18), Some(PinLevel::High));
    }

    #[test]
    fn set_energized_follows_polarity() {
        let mut board = PinBoard::new(true).unwrap();
        board.configure(18).unwrap();
        board.set_energized(18, true).unwrap();
        assert_eq!(board.level(18), Some(PinLevel::Low));
        board.set_energized(18, false).unwrap();
        assert_eq!(board.level(18), Some(PinLevel::High));
    }

    #[test]
    fn write_unconfigured_pin_fails() {
        let mut board = PinBoard::new(true).unwrap();
        assert!(board.write(23, PinLevel::Low).is_err());
        assert_eq!(board.level(23), None);
    }
}
