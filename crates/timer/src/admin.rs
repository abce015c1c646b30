//! Inspection and maintenance commands behind `pi-timer-ctl`.
//!
//! Everything here returns printable lines instead of writing to stdout, so
//! the binary stays a thin argument parser.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use std::fmt::Display;

use crate::db::{Db, HistoryEvent, ScheduleRow};
use crate::engine::MAX_DURATION_SECS;

/// History lines in the form `<time>: Device turned ON` and
/// `<time>: Device turned OFF (<n> seconds)`. An OFF without a preceding
/// ON in the listing is skipped.
pub fn format_history<Tz>(tz: &Tz, events: &[HistoryEvent]) -> Vec<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut lines = Vec::new();
    let mut last_on: Option<i64> = None;

    for ev in events {
        let Some(at) = tz.timestamp_opt(ev.timestamp, 0).single() else {
            continue;
        };
        let at = at.format("%Y-%m-%d %H:%M:%S");
        if ev.enabled {
            lines.push(format!("{at}: Device turned ON"));
            last_on = Some(ev.timestamp);
        } else if let Some(on) = last_on.take() {
            lines.push(format!(
                "{at}: Device turned OFF ({} seconds)",
                ev.timestamp - on
            ));
        }
    }

    lines
}

pub fn format_schedule<Tz>(tz: &Tz, device_id: i64, rows: &[ScheduleRow]) -> Vec<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if rows.is_empty() {
        return vec![format!("No schedule set for {device_id}")];
    }

    let fmt = |ts: i64| {
        tz.timestamp_opt(ts, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| ts.to_string())
    };

    let mut lines = vec!["Device schedule:".to_string()];
    for row in rows {
        lines.push(format!(
            "Run at {} for up to {} seconds (min {} seconds), set on {}",
            fmt(row.start_time),
            row.duration,
            row.min_duration,
            fmt(row.set_at)
        ));
    }
    lines
}

/// Parse a schedule start: `HH:MM` (today, in `tz`), RFC 3339, or unix
/// seconds.
pub fn parse_start<Tz: TimeZone>(
    tz: &Tz,
    input: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(ts) = input.parse::<i64>() {
        return Utc
            .timestamp_opt(ts, 0)
            .single()
            .with_context(|| format!("timestamp out of range: {input}"));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(time) = NaiveTime::parse_from_str(input, "%H:%M") {
        let today = now.with_timezone(tz).date_naive();
        return tz
            .from_local_datetime(&today.and_time(time))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("{input} does not exist today"));
    }

    bail!("unrecognised start time {input:?} (expected HH:MM, RFC 3339 or unix seconds)")
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub async fn devices(db: &Db) -> Result<Vec<String>> {
    let devices = db.list_devices().await?;
    if devices.is_empty() {
        return Ok(vec!["No devices registered.".to_string()]);
    }
    Ok(devices
        .iter()
        .map(|d| {
            format!(
                "{:>6}  group {:<6} pin {:<3} {:<8} {}",
                d.device_id, d.group_id, d.pin, d.device_type, d.display_name
            )
        })
        .collect())
}

pub async fn history(
    db: &Db,
    device_id: i64,
    hours: i64,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let since = hours
        .checked_mul(3600)
        .and_then(|secs| now.timestamp().checked_sub(secs))
        .filter(|_| hours > 0)
        .with_context(|| format!("hours must be a positive number of hours, got {hours}"))?;
    let events = db.history(device_id, since).await?;
    let lines = format_history(&Local, &events);
    if lines.is_empty() {
        return Ok(vec![format!(
            "No activity for device {device_id} in the last {hours} hour(s)."
        )]);
    }
    Ok(lines)
}

pub async fn clear_history(db: &Db, device_id: i64) -> Result<Vec<String>> {
    let n = db.clear_history(device_id).await?;
    Ok(vec![format!("Cleared history ({n} event(s)).")])
}

pub async fn show_schedule(db: &Db, device_id: i64, limit: i64) -> Result<Vec<String>> {
    let rows = db.latest_schedule(device_id, limit).await?;
    Ok(format_schedule(&Local, device_id, &rows))
}

pub async fn set_schedule(
    db: &Db,
    device_id: i64,
    start: DateTime<Utc>,
    duration: i64,
    min_duration: i64,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    if duration <= 0 || duration > MAX_DURATION_SECS {
        bail!("duration must be between 1 and {MAX_DURATION_SECS} seconds, got {duration}");
    }
    if min_duration < 0 || min_duration > duration {
        bail!("min duration must be between 0 and {duration}, got {min_duration}");
    }
    if db.get_device(device_id).await?.is_none() {
        tracing::warn!(device = device_id, "setting schedule for unregistered device");
    }

    db.add_schedule(
        device_id,
        &ScheduleRow {
            set_at: now.timestamp(),
            start_time: start.timestamp(),
            duration,
            min_duration,
        },
    )
    .await?;
    show_schedule(db, device_id, 1).await
}

pub async fn clear_schedule(db: &Db, device_id: i64) -> Result<Vec<String>> {
    let n = db.clear_schedule(device_id).await?;
    Ok(vec![format!("Cleared schedule ({n} interval(s)).")])
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DeviceRecord;

    fn ev(timestamp: i64, enabled: bool) -> HistoryEvent {
        HistoryEvent {
            timestamp,
            device_id: 101,
            enabled,
        }
    }

    fn t(h: u32, m: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(2026, 6, 1, h, m, s).unwrap().timestamp()
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[test]
    fn history_prints_runs_with_lengths() {
        let events = [
            ev(t(5, 0, 0), false),
            ev(t(6, 0, 0), true),
            ev(t(6, 3, 31), false),
            ev(t(7, 0, 0), true),
        ];
        assert_eq!(
            format_history(&Utc, &events),
            vec![
                "2026-06-01 06:00:00: Device turned ON",
                "2026-06-01 06:03:31: Device turned OFF (211 seconds)",
                "2026-06-01 07:00:00: Device turned ON",
            ]
        );
    }

    #[test]
    fn schedule_listing() {
        let rows = [ScheduleRow {
            set_at: t(5, 0, 0),
            start_time: t(14, 32, 0),
            duration: 211,
            min_duration: 60,
        }];
        let lines = format_schedule(&Utc, 101, &rows);
        assert_eq!(lines[0], "Device schedule:");
        assert_eq!(
            lines[1],
            "Run at 2026-06-01 14:32 for up to 211 seconds (min 60 seconds), set on 2026-06-01 05:00"
        );
        assert_eq!(format_schedule(&Utc, 7, &[]), vec!["No schedule set for 7"]);
    }

    #[test]
    fn start_formats() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 3, 0, 0).unwrap();
        assert_eq!(parse_start(&Utc, "14:32", now).unwrap().timestamp(), t(14, 32, 0));
        assert_eq!(
            parse_start(&Utc, "2026-06-01T14:32:00-07:00", now).unwrap().timestamp(),
            t(21, 32, 0)
        );
        assert_eq!(parse_start(&Utc, "1750000000", now).unwrap().timestamp(), 1_750_000_000);
        assert!(parse_start(&Utc, "half past two", now).is_err());
    }

    #[tokio::test]
    async fn set_then_show_and_clear_schedule() {
        let db = test_db().await;
        let now = Utc::now();
        let lines = set_schedule(&db, 101, now, 300, 60, now).await.unwrap();
        assert_eq!(lines[0], "Device schedule:");
        assert!(lines[1].contains("up to 300 seconds"));

        assert!(set_schedule(&db, 101, now, 30, 60, now).await.is_err());
        assert!(set_schedule(&db, 101, now, 0, 0, now).await.is_err());
        assert!(set_schedule(&db, 101, now, 10_000_000_000_000_000, 0, now)
            .await
            .is_err());
        assert!(set_schedule(&db, 101, now, MAX_DURATION_SECS + 1, 0, now)
            .await
            .is_err());
        assert_eq!(db.latest_schedule(101, 10).await.unwrap().len(), 1);

        let lines = clear_schedule(&db, 101).await.unwrap();
        assert_eq!(lines, vec!["Cleared schedule (1 interval(s))."]);
        assert_eq!(
            show_schedule(&db, 101, 5).await.unwrap(),
            vec!["No schedule set for 101"]
        );
    }

    #[tokio::test]
    async fn history_window_and_clear() {
        let db = test_db().await;
        let now = Utc::now().timestamp();
        db.record_event(101, true, now - 48 * 3600).await.unwrap();
        db.record_event(101, false, now - 48 * 3600 + 10).await.unwrap();
        db.record_event(101, true, now - 600).await.unwrap();
        db.record_event(101, false, now - 300).await.unwrap();

        let lines = history(&db, 101, 24, Utc::now()).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("(300 seconds)"));

        assert_eq!(
            clear_history(&db, 101).await.unwrap(),
            vec!["Cleared history (4 event(s))."]
        );
        let lines = history(&db, 101, 24, Utc::now()).await.unwrap();
        assert!(lines[0].starts_with("No activity"));
    }

    #[tokio::test]
    async fn history_rejects_out_of_range_hours() {
        let db = test_db().await;
        assert!(history(&db, 101, i64::MAX, Utc::now()).await.is_err());
        assert!(history(&db, 101, 0, Utc::now()).await.is_err());
        assert!(history(&db, 101, -5, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn devices_listing() {
        let db = test_db().await;
        assert_eq!(devices(&db).await.unwrap(), vec!["No devices registered."]);

        db.upsert_device(&DeviceRecord {
            device_id: 101,
            group_id: 1000,
            device_type: "valve".into(),
            display_name: "Front sprinklers".into(),
            pin: 18,
        })
        .await
        .unwrap();
        let lines = devices(&db).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Front sprinklers"));
        assert!(lines[0].contains("pin 18"));
    }
}
