//! Hardware watchdog keep-alive. If the daemon stops pulsing, the watchdog
//! power-cycles the host, so a hung process can never hold a valve open.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;

/// Character that tells the Linux watchdog driver a close is intentional.
const MAGIC_CLOSE: &[u8] = b"V";

pub struct Watchdog {
    device: Option<File>,
    pulses: u64,
}

impl Watchdog {
    /// Open the watchdog device at `path`, or run without one when `None`.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let device = match path {
            Some(p) => {
                let f = OpenOptions::new()
                    .write(true)
                    .open(p)
                    .with_context(|| format!("failed to open watchdog device: {p}"))?;
                tracing::info!(device = p, "watchdog armed");
                Some(f)
            }
            None => {
                tracing::info!("no watchdog device configured; liveness pulses are no-ops");
                None
            }
        };
        Ok(Self { device, pulses: 0 })
    }

    pub fn disabled() -> Self {
        Self {
            device: None,
            pulses: 0,
        }
    }

    pub fn pulse(&mut self) -> Result<()> {
        if let Some(f) = self.device.as_mut() {
            f.write_all(b"\0").context("watchdog keep-alive failed")?;
            f.flush().context("watchdog keep-alive failed")?;
        }
        self.pulses += 1;
        Ok(())
    }

    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    /// Stop the watchdog on a clean exit.
    pub fn disarm(mut self) -> Result<()> {
        if let Some(mut f) = self.device.take() {
            f.write_all(MAGIC_CLOSE).context("watchdog magic close failed")?;
            tracing::info!("watchdog disarmed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_watchdog_counts_pulses() {
        let mut w = Watchdog::open(None).unwrap();
        w.pulse().unwrap();
        w.pulse().unwrap();
        assert_eq!(w.pulses(), 2);
        w.disarm().unwrap();
    }

    #[test]
    fn pulses_and_magic_close_are_written() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut w = Watchdog::open(Some(&path)).unwrap();
        w.pulse().unwrap();
        w.pulse().unwrap();
        w.disarm().unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, b"\0\0V");
    }

    #[test]
    fn missing_device_is_an_error() {
        assert!(Watchdog::open(Some("/nonexistent/watchdog")).is_err());
    }
}
