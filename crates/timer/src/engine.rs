//! Per-poll enable/disable decision for one device.
//!
//! The engine is a pure function of the device's schedule intervals, its
//! recent on/off history and whether it is currently on. Budgets are derived
//! from recorded history rather than a running timer, so a restart (or a run
//! interrupted by a group lock) picks up exactly where the log says it left
//! off.
//!
//! ```text
//! for each interval (in source order):
//!   not active now / duration < min_duration   -> skip
//!   elapsed >= duration                        -> skip (budget spent)
//!   on || duration - elapsed > min_duration    -> ENABLE, poll in (duration - elapsed)
//!   otherwise                                  -> DISABLE (remaining burst too short)
//! nothing matched                              -> DISABLE, poll in IDLE_POLL_SECS
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::accounting::elapsed_on_seconds;
use crate::db::HistoryEvent;

/// Poll delay recommended when no interval wants the device on.
pub const IDLE_POLL_SECS: i64 = 10_000;

/// Extra time an interval stays eligible past its nominal end, so a run that
/// was deferred (group lock, restart) can still finish its budget.
pub const WINDOW_SLACK_SECS: i64 = 60 * 60;

/// Accounting window for daily fixed schedules. Shorter than a day so the
/// previous day's run at the same time is not counted.
pub const DAILY_WINDOW_SECS: i64 = 23 * 60 * 60;

/// Longest run budget a single interval may carry.
pub const MAX_DURATION_SECS: i64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One scheduled eligibility period with its own run budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleInterval {
    pub start: DateTime<Utc>,
    /// Total on-time allowed within the window.
    pub duration_secs: i64,
    /// Shortest run worth starting.
    pub min_duration_secs: i64,
    /// How long after `start` the interval stays eligible; also the length of
    /// the trailing window over which on-time is counted.
    pub window_secs: i64,
}

impl ScheduleInterval {
    pub fn new(start: DateTime<Utc>, duration_secs: i64, min_duration_secs: i64) -> Self {
        Self {
            start,
            duration_secs,
            min_duration_secs,
            window_secs: duration_secs.saturating_add(WINDOW_SLACK_SECS),
        }
    }

    /// Interval for a fixed time-of-day schedule: eligible for the rest of the
    /// day, budget counted over the trailing [`DAILY_WINDOW_SECS`].
    pub fn daily(start: DateTime<Utc>, duration_secs: i64, min_duration_secs: i64) -> Self {
        Self {
            start,
            duration_secs,
            min_duration_secs,
            window_secs: DAILY_WINDOW_SECS,
        }
    }

    /// `None` when the window does not fit in a timestamp.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        Duration::try_seconds(self.window_secs).and_then(|w| self.start.checked_add_signed(w))
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_degenerate() && self.start <= now && self.end().is_some_and(|end| now < end)
    }

    /// Intervals that can never run: budget below the minimum burst, or
    /// longer than [`MAX_DURATION_SECS`].
    pub fn is_degenerate(&self) -> bool {
        self.duration_secs < self.min_duration_secs || self.duration_secs > MAX_DURATION_SECS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub enable: bool,
    /// Seconds until the device should be evaluated again.
    pub poll_secs: i64,
    /// On-time already counted against the matching interval.
    pub elapsed_secs: i64,
}

impl Decision {
    pub fn idle() -> Self {
        Self {
            enable: false,
            poll_secs: IDLE_POLL_SECS,
            elapsed_secs: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Decide whether the device should be on right now.
///
/// The first interval that is active and still under budget decides; see the
/// module docs for the exact rule.
pub fn evaluate(
    intervals: &[ScheduleInterval],
    history: &[HistoryEvent],
    currently_on: bool,
    now: DateTime<Utc>,
) -> Decision {
    let now_ts = now.timestamp();

    for iv in intervals {
        if !iv.is_active(now) {
            continue;
        }

        let elapsed = elapsed_on_seconds(history, now_ts - iv.window_secs, now_ts);
        if elapsed >= iv.duration_secs {
            continue;
        }

        let remaining = iv.duration_secs - elapsed;
        if currently_on || remaining > iv.min_duration_secs {
            return Decision {
                enable: true,
                poll_secs: remaining,
                elapsed_secs: elapsed,
            };
        }
        return Decision {
            elapsed_secs: elapsed,
            ..Decision::idle()
        };
    }

    Decision::idle()
}

/// How far back history must be read to evaluate every interval active at
/// `now`. `None` when nothing is active.
pub fn lookback_secs(intervals: &[ScheduleInterval], now: DateTime<Utc>) -> Option<i64> {
    intervals
        .iter()
        .filter(|iv| iv.is_active(now))
        .map(|iv| iv.window_secs)
        .max()
}

// ===========================================================================
// Tests
// ===========================================================================
