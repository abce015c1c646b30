//! Where a device's schedule intervals come from.

use anyhow::Result;
use chrono::{DateTime, Datelike, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Db, ScheduleRow};
use crate::engine::{ScheduleInterval, MAX_DURATION_SECS};

/// Upper bound on rows read for a calendar-driven device. A sync for one day
/// never produces anywhere near this many.
const CALENDAR_ROW_LIMIT: i64 = 64;

fn default_latest() -> i64 {
    1
}

/// Schedule backend for one device, selected in the config file by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScheduleSource {
    /// Never scheduled; the device stays off.
    None,
    /// Every day at `hour:minute` local time, up to `duration_sec` of on-time.
    Static {
        hour: u32,
        minute: u32,
        duration_sec: i64,
        min_duration_sec: i64,
    },
    /// The newest `latest` intervals stored with `pi-timer-ctl schedule set`.
    Persisted {
        #[serde(default = "default_latest")]
        latest: i64,
    },
    /// Intervals written by the calendar sync from `device:<id>` events.
    Calendar {
        min_duration_sec: i64,
        max_duration_sec: i64,
    },
}

impl ScheduleSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleSource::None => "none",
            ScheduleSource::Static { .. } => "static",
            ScheduleSource::Persisted { .. } => "persisted",
            ScheduleSource::Calendar { .. } => "calendar",
        }
    }

    /// Intervals to evaluate at `now`, in evaluation order.
    pub async fn intervals(
        &self,
        db: &Db,
        device_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleInterval>> {
        match self {
            ScheduleSource::None => Ok(Vec::new()),
            ScheduleSource::Static {
                hour,
                minute,
                duration_sec,
                min_duration_sec,
            } => Ok(daily_interval(&Local, *hour, *minute, *duration_sec, *min_duration_sec, now)
                .into_iter()
                .collect()),
            ScheduleSource::Persisted { latest } => {
                let rows = db.latest_schedule(device_id, *latest).await?;
                Ok(rows.iter().filter_map(interval_from_row).collect())
            }
            ScheduleSource::Calendar { .. } => {
                let rows = db.latest_schedule(device_id, CALENDAR_ROW_LIMIT).await?;
                Ok(rows.iter().filter_map(interval_from_row).collect())
            }
        }
    }
}

/// Today's occurrence of a fixed `hour:minute` schedule in `tz`.
///
/// Returns `None` when that wall-clock time does not exist today (DST gap).
pub fn daily_interval<Tz: TimeZone>(
    tz: &Tz,
    hour: u32,
    minute: u32,
    duration_sec: i64,
    min_duration_sec: i64,
    now: DateTime<Utc>,
) -> Option<ScheduleInterval> {
    let local = now.with_timezone(tz);
    let start = tz
        .with_ymd_and_hms(local.year(), local.month(), local.day(), hour, minute, 0)
        .earliest()?;
    Some(ScheduleInterval::daily(
        start.with_timezone(&Utc),
        duration_sec,
        min_duration_sec,
    ))
}

/// `None` for rows whose start is out of range or whose duration exceeds
/// [`MAX_DURATION_SECS`].
pub fn interval_from_row(row: &ScheduleRow) -> Option<ScheduleInterval> {
    if row.duration > MAX_DURATION_SECS {
        tracing::warn!(duration = row.duration, "skipping oversized schedule row");
        return None;
    }
    let start = Utc.timestamp_opt(row.start_time, 0).single()?;
    Some(ScheduleInterval::new(start, row.duration, row.min_duration))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HistoryEvent;
    use crate::engine::{evaluate, IDLE_POLL_SECS};

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, m, 0).unwrap()
    }

    // -- Fixed daily schedule (14:32, 211 s, min 60 s) ------------------------

    fn front_lawn(now: DateTime<Utc>) -> ScheduleInterval {
        daily_interval(&Utc, 14, 32, 211, 60, now).unwrap()
    }

    #[test]
    fn daily_before_start_is_not_eligible() {
        let now = utc(14, 31);
        let d = evaluate(&[front_lawn(now)], &[], false, now);
        assert!(!d.enable);
        assert_eq!(d.poll_secs, IDLE_POLL_SECS);
    }

    #[test]
    fn daily_after_start_runs_full_budget() {
        let now = utc(14, 33);
        let d = evaluate(&[front_lawn(now)], &[], false, now);
        assert!(d.enable);
        assert_eq!(d.poll_secs, 211);
    }

    #[test]
    fn daily_budget_spent_today_is_idle() {
        let now = utc(14, 33);
        let on = utc(14, 32).timestamp() - 300;
        let history = [
            HistoryEvent {
                timestamp: on,
                device_id: 101,
                enabled: true,
            },
            HistoryEvent {
                timestamp: on + 211,
                device_id: 101,
                enabled: false,
            },
        ];
        let d = evaluate(&[front_lawn(now)], &history, false, now);
        assert!(!d.enable);
        assert_eq!(d.poll_secs, IDLE_POLL_SECS);
    }

    #[test]
    fn yesterdays_run_is_outside_the_window() {
        let now = utc(14, 33);
        let yesterday = utc(14, 32).timestamp() - 24 * 3600;
        let history = [
            HistoryEvent {
                timestamp: yesterday,
                device_id: 101,
                enabled: true,
            },
            HistoryEvent {
                timestamp: yesterday + 211,
                device_id: 101,
                enabled: false,
            },
        ];
        assert!(evaluate(&[front_lawn(now)], &history, false, now).enable);
    }

    #[test]
    fn daily_interval_starts_today() {
        let iv = front_lawn(utc(3, 0));
        assert_eq!(iv.start, utc(14, 32));
        assert_eq!(iv.duration_secs, 211);
        assert_eq!(iv.min_duration_secs, 60);
    }

    #[tokio::test]
    async fn static_source_uses_local_time() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let today = Local::now().date_naive();
        let now = Local
            .from_local_datetime(&today.and_hms_opt(14, 33, 0).unwrap())
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        let source = ScheduleSource::Static {
            hour: 14,
            minute: 32,
            duration_sec: 211,
            min_duration_sec: 60,
        };

        let ivs = source.intervals(&db, 101, now).await.unwrap();
        assert_eq!(ivs.len(), 1);
        assert!(ivs[0].is_active(now));
        assert_eq!((now - ivs[0].start).num_seconds(), 60);
    }

    // -- Stored intervals -----------------------------------------------------

    #[tokio::test]
    async fn persisted_source_reads_newest_rows() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        for (set_at, start) in [(1, 10_000), (2, 20_000), (3, 30_000)] {
            db.add_schedule(
                101,
                &ScheduleRow {
                    set_at,
                    start_time: start,
                    duration: 600,
                    min_duration: 60,
                },
            )
            .await
            .unwrap();
        }

        let source = ScheduleSource::Persisted { latest: 2 };
        let ivs = source.intervals(&db, 101, utc(0, 0)).await.unwrap();
        let starts: Vec<i64> = ivs.iter().map(|iv| iv.start.timestamp()).collect();
        assert_eq!(starts, vec![30_000, 20_000]);
        assert_eq!(ivs[0].window_secs, 600 + crate::engine::WINDOW_SLACK_SECS);
    }

    #[tokio::test]
    async fn oversized_rows_are_dropped() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.add_schedule(
            101,
            &ScheduleRow {
                set_at: 1,
                start_time: 10_000,
                duration: 10_000_000_000_000_000,
                min_duration: 0,
            },
        )
        .await
        .unwrap();

        let source = ScheduleSource::Persisted { latest: 1 };
        let ivs = source.intervals(&db, 101, utc(0, 0)).await.unwrap();
        assert!(ivs.is_empty());
        assert_eq!(
            evaluate(&ivs, &[], false, utc(0, 0)).poll_secs,
            IDLE_POLL_SECS
        );
    }

    #[tokio::test]
    async fn none_source_has_no_intervals() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let ivs = ScheduleSource::None
            .intervals(&db, 101, utc(12, 0))
            .await
            .unwrap();
        assert!(ivs.is_empty());
    }

    // -- Config parsing -------------------------------------------------------

    #[test]
    fn parse_tagged_sources() {
        #[derive(Deserialize)]
        struct Wrapper {
            schedule: ScheduleSource,
        }

        let w: Wrapper = toml::from_str(
            r#"schedule = { kind = "static", hour = 14, minute = 32, duration_sec = 211, min_duration_sec = 60 }"#,
        )
        .unwrap();
        assert_eq!(w.schedule.kind(), "static");

        let w: Wrapper = toml::from_str(r#"schedule = { kind = "persisted" }"#).unwrap();
        assert_eq!(w.schedule, ScheduleSource::Persisted { latest: 1 });

        let w: Wrapper = toml::from_str(
            r#"schedule = { kind = "calendar", min_duration_sec = 60, max_duration_sec = 1200 }"#,
        )
        .unwrap();
        assert_eq!(w.schedule.kind(), "calendar");

        assert!(toml::from_str::<Wrapper>(r#"schedule = { kind = "lunar" }"#).is_err());
    }
}
