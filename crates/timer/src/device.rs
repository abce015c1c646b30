//! A scheduled output device (one relay, one valve).
//!
//! A device owns its on/off state and nothing else; the group lock, pins,
//! event log and status view live in the [`DeviceContext`] shared by every
//! device in the control loop.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::arbiter::GroupArbiter;
use crate::db::{Db, DeviceRecord};
use crate::engine::{evaluate, lookback_secs, Decision};
use crate::gpio::PinBoard;
use crate::schedule::ScheduleSource;
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Only between construction and the forced turn-off at registration.
    Unknown,
    On,
    Off,
}

/// Everything a device touches when it changes state.
pub struct DeviceContext {
    pub db: Db,
    pub arbiter: GroupArbiter,
    pub pins: PinBoard,
    pub status: SharedState,
}

impl DeviceContext {
    pub fn new(db: Db, pins: PinBoard, status: SharedState) -> Self {
        Self {
            db,
            arbiter: GroupArbiter::new(),
            pins,
            status,
        }
    }
}

pub struct Device {
    record: DeviceRecord,
    pin: u8,
    source: ScheduleSource,
    state: PowerState,
}

impl Device {
    /// Claim the device's pin and force it off.
    pub async fn register(
        record: DeviceRecord,
        source: ScheduleSource,
        ctx: &mut DeviceContext,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let pin = u8::try_from(record.pin)
            .with_context(|| {
                format!("device {}: pin {} out of range", record.device_id, record.pin)
            })?;
        ctx.pins.configure(pin)?;

        let mut device = Self {
            record,
            pin,
            source,
            state: PowerState::Unknown,
        };
        device.turn_off(ctx, now).await?;
        Ok(device)
    }

    pub fn id(&self) -> i64 {
        self.record.device_id
    }

    pub fn group(&self) -> i64 {
        self.record.group_id
    }

    pub fn name(&self) -> &str {
        &self.record.display_name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_on(&self) -> bool {
        self.state == PowerState::On
    }

    pub fn source(&self) -> &ScheduleSource {
        &self.source
    }

    /// Release the relay. A no-op when already off.
    pub async fn turn_off(&mut self, ctx: &mut DeviceContext, now: DateTime<Utc>) -> Result<()> {
        if self.state == PowerState::Off {
            return Ok(());
        }

        ctx.pins.set_energized(self.pin, false)?;
        self.state = PowerState::Off;
        ctx.arbiter.release(self.group(), self.id());

        info!(device = self.id(), name = %self.name(), "turned OFF device");
        ctx.status.write().await.record_device(self.id(), false);
        ctx.db.record_event(self.id(), false, now.timestamp()).await
    }

    /// Energize the relay if the group lock allows it. Returns whether the
    /// device is on afterwards.
    pub async fn turn_on(&mut self, ctx: &mut DeviceContext, now: DateTime<Utc>) -> Result<bool> {
        if self.state == PowerState::On {
            return Ok(true);
        }

        if !ctx.arbiter.try_acquire(self.group(), self.id()) {
            let holder = ctx.arbiter.holder(self.group()).unwrap_or_default();
            debug!(
                device = self.id(),
                name = %self.name(),
                group = self.group(),
                holder,
                "waiting for group lock"
            );
            ctx.status.write().await.record_lock_wait(self.id(), holder);
            return Ok(false);
        }

        if let Err(e) = ctx.pins.set_energized(self.pin, true) {
            ctx.arbiter.release(self.group(), self.id());
            return Err(e);
        }
        self.state = PowerState::On;

        info!(device = self.id(), name = %self.name(), "turned ON device");
        ctx.status.write().await.record_device(self.id(), true);
        ctx.db.record_event(self.id(), true, now.timestamp()).await?;
        Ok(true)
    }

    /// Evaluate the schedule and apply the decision. Returns the recommended
    /// number of seconds until the next evaluation.
    pub async fn update(&mut self, ctx: &mut DeviceContext, now: DateTime<Utc>) -> Result<i64> {
        let decision = self.decide(&ctx.db, now).await?;

        if decision.enable {
            if !self.is_on() {
                info!(
                    device = self.id(),
                    elapsed_sec = decision.elapsed_secs,
                    run_for_sec = decision.poll_secs,
                    "schedule wants device on"
                );
            }
            self.turn_on(ctx, now).await?;
        } else {
            self.turn_off(ctx, now).await?;
        }

        Ok(decision.poll_secs)
    }

    async fn decide(&self, db: &Db, now: DateTime<Utc>) -> Result<Decision> {
        let intervals = self.source.intervals(db, self.id(), now).await?;
        let Some(lookback) = lookback_secs(&intervals, now) else {
            return Ok(Decision::idle());
        };
        let history = db.history(self.id(), now.timestamp() - lookback).await?;
        Ok(evaluate(&intervals, &history, self.is_on(), now))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
