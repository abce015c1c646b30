//! The control loop: evaluate every device, sleep, repeat, and leave every
//! relay released on the way out.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::calendar::{CalendarApi, CalendarSync};
use crate::config::{DaemonConfig, DeviceEntry};
use crate::device::{Device, DeviceContext};
use crate::gpio::PinBoard;
use crate::watchdog::Watchdog;

/// Why [`sleep_with_pulse`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Shutdown,
}

/// Sleep for `total`, pulsing the watchdog at least every `step`, and return
/// early once `shutdown` turns true (or its sender is gone).
pub async fn sleep_with_pulse(
    total: Duration,
    step: Duration,
    watchdog: &mut Watchdog,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Wake> {
    let deadline = Instant::now() + total;

    loop {
        if *shutdown.borrow() {
            return Ok(Wake::Shutdown);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(Wake::Elapsed);
        }

        let wait = step.min(deadline - now);
        let sender_gone = tokio::select! {
            _ = sleep(wait) => false,
            changed = shutdown.changed() => changed.is_err(),
        };
        watchdog.pulse()?;

        if sender_gone {
            return Ok(Wake::Shutdown);
        }
    }
}

pub struct Daemon<A> {
    ctx: DeviceContext,
    devices: Vec<Device>,
    calendar: Option<(A, CalendarSync)>,
    watchdog: Watchdog,
    max_poll_sec: i64,
    pulse: Duration,
}

impl<A: CalendarApi> Daemon<A> {
    /// Register (and force off) every configured device.
    pub async fn start(
        mut ctx: DeviceContext,
        entries: &[DeviceEntry],
        calendar: Option<(A, CalendarSync)>,
        watchdog: Watchdog,
        cfg: &DaemonConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut devices = Vec::with_capacity(entries.len());
        for entry in entries {
            let device =
                Device::register(entry.record(), entry.schedule.clone(), &mut ctx, now).await?;
            info!(
                device = device.id(),
                name = %device.name(),
                group = device.group(),
                pin = device.pin(),
                schedule = device.source().kind(),
                "registered device"
            );
            devices.push(device);
        }

        ctx.status
            .write()
            .await
            .record_system(format!("daemon started with {} device(s)", devices.len()));

        Ok(Self {
            ctx,
            devices,
            calendar,
            watchdog,
            max_poll_sec: cfg.max_poll_sec,
            pulse: Duration::from_millis(cfg.watchdog_pulse_ms),
        })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// One pass over the calendar and every device. Returns the number of
    /// seconds to sleep before the next pass.
    pub async fn cycle(&mut self, now: DateTime<Utc>) -> Result<i64> {
        if let Some((api, sync)) = self.calendar.as_mut() {
            sync.refresh_if_due(api, &self.ctx.db, &self.ctx.status, now)
                .await?;
        }

        let mut poll = self.max_poll_sec;
        for device in self.devices.iter_mut() {
            poll = poll.min(device.update(&mut self.ctx, now).await?);
        }
        Ok(poll.max(1))
    }

    /// Run until `shutdown` is set or a cycle fails, then release every
    /// device, close the database and disarm the watchdog.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.drive(&mut shutdown).await
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let result = self.run_cycles(shutdown).await;
        if let Err(e) = &result {
            error!(error = %format!("{e:#}"), "control loop failed; shutting down");
            self.ctx
                .status
                .write()
                .await
                .record_error(format!("control loop failed: {e:#}"));
        }

        let finished = self.finish(Utc::now()).await;
        result.and(finished)
    }

    async fn run_cycles(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            let poll = self.cycle(Utc::now()).await?;
            let wake = sleep_with_pulse(
                Duration::from_secs(poll.unsigned_abs()),
                self.pulse,
                &mut self.watchdog,
                shutdown,
            )
            .await?;

            if wake == Wake::Shutdown {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }

    /// Turn every device off. Keeps going past individual failures so one
    /// bad write cannot leave the rest energized.
    pub async fn all_off(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut first_err = None;
        for device in self.devices.iter_mut() {
            if let Err(e) = device.turn_off(&mut self.ctx, now).await {
                warn!(device = device.id(), error = %e, "failed to turn device off");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn finish(&mut self, now: DateTime<Utc>) -> Result<()> {
        let off = self.all_off(now).await;
        self.ctx.db.close().await;
        let disarmed = std::mem::replace(&mut self.watchdog, Watchdog::disabled()).disarm();
        info!("daemon stopped");
        off.and(disarmed)
    }
}

/// Drive every pin in `pins` to the released level on a fresh board. Used
/// when the control loop died without running its own shutdown.
pub fn release_all(pins: &[u8], active_low: bool) -> Result<()> {
    let mut board = PinBoard::new(active_low)?;
    for &pin in pins {
        board.configure(pin)?;
    }
    warn!(pins = ?pins, "fail-safe released every relay");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
