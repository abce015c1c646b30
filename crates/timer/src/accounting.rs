//! On-time accounting over a trailing window of device history.

use crate::db::HistoryEvent;

/// Total seconds a device spent on between `since` (exclusive) and `now`.
///
/// Each "on" event is paired with the next "off" event. A run still open at
/// the end of the history counts through `now`. Only events after `since`
/// are considered, so a run that started before the window contributes
/// nothing, not even its in-window tail; an "off" with no preceding "on"
/// contributes zero.
///
/// The result is clamped to `0..=now - since`.
pub fn elapsed_on_seconds(history: &[HistoryEvent], since: i64, now: i64) -> i64 {
    let mut run_start: Option<i64> = None;
    let mut total: i64 = 0;

    for ev in history.iter().filter(|e| e.timestamp > since) {
        if ev.enabled {
            run_start = Some(ev.timestamp);
        } else if let Some(start) = run_start.take() {
            total += (ev.timestamp - start).max(0);
        }
    }

    if let Some(start) = run_start {
        total += (now - start).max(0);
    }

    total.clamp(0, (now - since).max(0))
}

// ===========================================================================
// Tests
// ===========================================================================
