//! Calendar-driven schedules.
//!
//! Events titled `device:<id>` on a shared calendar become today's run
//! intervals for that device. The sync is rate-limited, tolerates a few
//! failed fetches (refreshing the OAuth token along the way) and never
//! touches stored schedules unless a fetch succeeds.

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::Context;
use chrono::{DateTime, Duration, FixedOffset, Local, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::CalendarConfig;
use crate::db::{Db, ScheduleRow, TokenPair, LAST_CALENDAR_SYNC};
use crate::state::{CalendarStatus, SharedState};

/// Redirect URI for the copy-paste (out-of-band) consent flow.
const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.readonly";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("calendar request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("calendar rejected credentials (HTTP {0})")]
    Auth(u16),
    #[error("calendar API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("unexpected calendar response: {0}")]
    Decode(String),
    #[error("no OAuth tokens stored; run `pi-timer-ctl authenticate`")]
    NotAuthenticated,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether a fresh access token might fix this.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_) | SyncError::Api { code: 401, .. })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Device id from an event title of the form `device:<id>`.
pub fn device_tag(summary: &str) -> Option<i64> {
    let (tag, id) = summary.split_once(':')?;
    if tag.trim() != "device" {
        return None;
    }
    id.trim().parse().ok()
}

#[derive(Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    summary: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    /// Absent for all-day events, which never drive a device.
    date_time: Option<DateTime<FixedOffset>>,
}

/// Decode an events-list response body.
pub fn parse_events(body: Value) -> Result<Vec<CalendarEvent>, SyncError> {
    if let Some(err) = body.get("error") {
        return Err(api_error(err));
    }

    let list: EventList =
        serde_json::from_value(body).map_err(|e| SyncError::Decode(e.to_string()))?;

    Ok(list
        .items
        .into_iter()
        .filter_map(|ev| {
            let start = ev.start?.date_time?;
            let end = ev.end?.date_time?;
            Some(CalendarEvent {
                summary: ev.summary.unwrap_or_default(),
                start: start.with_timezone(&Utc),
                end: end.with_timezone(&Utc),
            })
        })
        .collect())
}

fn api_error(err: &Value) -> SyncError {
    // Calendar errors are objects; OAuth endpoint errors are plain strings.
    match err {
        Value::String(code) => SyncError::Api {
            code: 0,
            message: code.clone(),
        },
        _ => SyncError::Api {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Remote API
// ---------------------------------------------------------------------------

#[allow(async_fn_in_trait)]
pub trait CalendarApi {
    /// Events overlapping `[from, to)`, recurring events expanded.
    async fn list_events(
        &self,
        access_token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, SyncError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, SyncError>;
}

pub struct GoogleCalendar {
    client: Client,
    cfg: CalendarConfig,
}

impl GoogleCalendar {
    pub fn new(cfg: CalendarConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }

    /// Consent page URL for the `authenticate` command.
    pub fn auth_url(&self) -> anyhow::Result<String> {
        let url = reqwest::Url::parse_with_params(
            &self.cfg.auth_url,
            &[
                ("scope", CALENDAR_SCOPE),
                ("redirect_uri", OOB_REDIRECT_URI),
                ("response_type", "code"),
                ("access_type", "offline"),
                ("client_id", self.cfg.client_id.as_str()),
            ],
        )
        .with_context(|| format!("invalid auth_url: {}", self.cfg.auth_url))?;
        Ok(url.into())
    }

    /// Trade an authorization code for a token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenPair, SyncError> {
        let params = [
            ("code", code),
            ("client_id", self.cfg.client_id.as_str()),
            ("client_secret", self.cfg.client_secret.as_str()),
            ("redirect_uri", OOB_REDIRECT_URI),
            ("grant_type", "authorization_code"),
        ];
        let body = self.token_request(&params).await?;

        Ok(TokenPair {
            access_token: required_str(&body, "access_token")?,
            refresh_token: required_str(&body, "refresh_token")?,
        })
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<Value, SyncError> {
        let resp = self
            .client
            .post(&self.cfg.token_url)
            .form(params)
            .send()
            .await?;
        let body: Value = resp.json().await?;

        if let Some(err) = body.get("error") {
            return Err(match body.get("error_description").and_then(Value::as_str) {
                Some(desc) => SyncError::Api {
                    code: 0,
                    message: format!("{}: {desc}", err.as_str().unwrap_or("oauth")),
                },
                None => api_error(err),
            });
        }
        Ok(body)
    }
}

fn required_str(body: &Value, field: &str) -> Result<String, SyncError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| SyncError::Decode(format!("missing {field}")))
}

impl CalendarApi for GoogleCalendar {
    async fn list_events(
        &self,
        access_token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, SyncError> {
        let url = format!(
            "{}/calendars/{}/events",
            self.cfg.api_base.trim_end_matches('/'),
            self.cfg.calendar_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("timeMin", from.to_rfc3339()),
                ("timeMax", to.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(status.as_u16()));
        }

        let body: Value = resp.json().await?;
        if !status.is_success() && body.get("error").is_none() {
            return Err(SyncError::Api {
                code: i64::from(status.as_u16()),
                message: status.to_string(),
            });
        }
        parse_events(body)
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, SyncError> {
        let params = [
            ("client_id", self.cfg.client_id.as_str()),
            ("client_secret", self.cfg.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let body = self.token_request(&params).await?;
        required_str(&body, "access_token")
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Per-device bounds applied to synced intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_duration_sec: i64,
    pub max_duration_sec: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NotDue,
    Synced { devices: usize, intervals: usize },
    Failed,
    GaveUp,
}

pub struct CalendarSync {
    refresh_interval: Duration,
    max_errors: u32,
    error_count: u32,
    last_attempt: Option<DateTime<Utc>>,
    last_sync: Option<DateTime<Utc>>,
    limits: BTreeMap<i64, DeviceLimits>,
}

impl CalendarSync {
    pub fn new(cfg: &CalendarConfig, limits: BTreeMap<i64, DeviceLimits>) -> Self {
        Self {
            refresh_interval: Duration::seconds(cfg.refresh_interval_sec),
            max_errors: cfg.max_consecutive_errors,
            error_count: 0,
            last_attempt: None,
            last_sync: None,
            limits,
        }
    }

    /// Like [`CalendarSync::new`], resuming from the last successful sync
    /// recorded in the database.
    pub async fn load(
        cfg: &CalendarConfig,
        limits: BTreeMap<i64, DeviceLimits>,
        db: &Db,
    ) -> anyhow::Result<Self> {
        let mut sync = Self::new(cfg, limits);
        if let Some(ts) = stored_sync_time(db).await? {
            info!(last_sync = %ts, "resuming calendar sync state");
            sync.last_sync = Some(ts);
            sync.last_attempt = Some(ts);
        }
        Ok(sync)
    }

    /// Pick up changes another process made to the stored sync time: a newer
    /// time means someone else synced, a missing one means a resync was
    /// requested.
    async fn reconcile(&mut self, db: &Db) -> anyhow::Result<()> {
        let stored = stored_sync_time(db).await?;
        if stored == self.last_sync {
            return Ok(());
        }

        match stored {
            Some(ts) => {
                self.last_sync = Some(ts);
                self.last_attempt = self.last_attempt.max(Some(ts));
            }
            None => {
                info!("calendar resync requested");
                self.last_sync = None;
                self.last_attempt = None;
            }
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.last_attempt
            .map_or(true, |t| now - t >= self.refresh_interval)
    }

    pub fn status(&self) -> CalendarStatus {
        CalendarStatus {
            last_sync: self.last_sync,
            consecutive_errors: self.error_count,
        }
    }

    /// Sync if the refresh interval has passed since the last attempt.
    pub async fn refresh_if_due<A: CalendarApi>(
        &mut self,
        api: &A,
        db: &Db,
        status: &SharedState,
        now: DateTime<Utc>,
    ) -> anyhow::Result<SyncOutcome> {
        self.reconcile(db).await?;
        if !self.is_due(now) {
            return Ok(SyncOutcome::NotDue);
        }
        self.force(api, db, status, now).await
    }

    /// Sync now regardless of the refresh interval. Only storage failures
    /// are returned as errors; calendar failures are counted and logged.
    pub async fn force<A: CalendarApi>(
        &mut self,
        api: &A,
        db: &Db,
        status: &SharedState,
        now: DateTime<Utc>,
    ) -> anyhow::Result<SyncOutcome> {
        self.last_attempt = Some(now);
        info!("syncing calendar");

        let err = match self.sync(api, db, now).await {
            Ok((devices, intervals)) => {
                self.error_count = 0;
                self.last_sync = Some(now);
                db.set_global(LAST_CALENDAR_SYNC, &now.timestamp().to_string())
                    .await?;
                info!(devices, intervals, "calendar sync complete");
                status.write().await.record_sync(
                    self.status(),
                    format!("calendar synced: {intervals} interval(s) for {devices} device(s)"),
                );
                return Ok(SyncOutcome::Synced { devices, intervals });
            }
            Err(SyncError::Storage(e)) => return Err(e),
            Err(e) => e,
        };

        self.error_count += 1;
        if self.error_count > self.max_errors {
            error!(
                error = %err,
                consecutive_errors = self.error_count,
                "too many calendar errors in a row; giving up"
            );
            status
                .write()
                .await
                .record_sync(self.status(), format!("calendar sync giving up: {err}"));
            return Ok(SyncOutcome::GaveUp);
        }

        warn!(error = %err, consecutive_errors = self.error_count, "calendar sync failed");
        status
            .write()
            .await
            .record_sync(self.status(), format!("calendar sync failed: {err}"));

        if self.error_count == 1 || err.is_auth() {
            self.refresh_token(api, db, status).await?;
        }
        Ok(SyncOutcome::Failed)
    }

    async fn sync<A: CalendarApi>(
        &self,
        api: &A,
        db: &Db,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), SyncError> {
        let tokens = db.get_tokens().await?.ok_or(SyncError::NotAuthenticated)?;
        let events = api
            .list_events(&tokens.access_token, now - Duration::days(1), now + Duration::days(1))
            .await?;

        let plan = todays_rows(&Local, &events, &self.limits, now);
        let intervals = plan.values().map(Vec::len).sum();
        for (device_id, rows) in &plan {
            db.replace_schedule(*device_id, rows).await?;
        }
        Ok((plan.len(), intervals))
    }

    async fn refresh_token<A: CalendarApi>(
        &self,
        api: &A,
        db: &Db,
        status: &SharedState,
    ) -> anyhow::Result<()> {
        let Some(tokens) = db.get_tokens().await? else {
            warn!("cannot refresh calendar token: not authenticated");
            return Ok(());
        };

        info!("refreshing calendar access token");
        match api.refresh_access_token(&tokens.refresh_token).await {
            Ok(access_token) => {
                db.set_tokens(&TokenPair {
                    access_token,
                    refresh_token: tokens.refresh_token,
                })
                .await
            }
            Err(SyncError::Storage(e)) => Err(e),
            Err(e) => {
                warn!(error = %e, "calendar token refresh failed");
                status
                    .write()
                    .await
                    .record_error(format!("calendar token refresh failed: {e}"));
                Ok(())
            }
        }
    }
}

async fn stored_sync_time(db: &Db) -> anyhow::Result<Option<DateTime<Utc>>> {
    let Some(raw) = db.get_global(LAST_CALENDAR_SYNC).await? else {
        return Ok(None);
    };
    let ts = raw
        .parse::<i64>()
        .ok()
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
    if ts.is_none() {
        warn!(value = %raw, "ignoring unreadable {LAST_CALENDAR_SYNC}");
    }
    Ok(ts)
}

/// Request a fresh sync from whichever process runs next.
pub async fn request_resync(db: &Db) -> anyhow::Result<()> {
    db.delete_global(LAST_CALENDAR_SYNC).await?;
    Ok(())
}

/// Schedule rows for every calendar device from the events starting on
/// `now`'s date in `tz`.
///
/// Every device in `limits` gets an entry, empty when it has no event
/// today. Tagged events for devices without limits are ignored.
pub fn todays_rows<Tz>(
    tz: &Tz,
    events: &[CalendarEvent],
    limits: &BTreeMap<i64, DeviceLimits>,
    now: DateTime<Utc>,
) -> BTreeMap<i64, Vec<ScheduleRow>>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let today = now.with_timezone(tz).date_naive();
    let mut plan: BTreeMap<i64, Vec<ScheduleRow>> =
        limits.keys().map(|id| (*id, Vec::new())).collect();

    for ev in events {
        let Some(device_id) = device_tag(&ev.summary) else {
            continue;
        };
        let Some(lim) = limits.get(&device_id) else {
            warn!(device = device_id, summary = %ev.summary, "calendar event for unknown device");
            continue;
        };
        if ev.start.with_timezone(tz).date_naive() != today {
            continue;
        }

        let mut duration = (ev.end - ev.start).num_seconds().max(0);
        if duration > lim.max_duration_sec {
            warn!(
                device = device_id,
                duration_sec = duration,
                max_duration_sec = lim.max_duration_sec,
                "calendar duration exceeds maximum; clamping"
            );
            duration = lim.max_duration_sec;
        }

        info!(
            device = device_id,
            start = %ev.start.with_timezone(tz).format("%H:%M"),
            duration_sec = duration,
            "device scheduled from calendar"
        );
        if let Some(rows) = plan.get_mut(&device_id) {
            rows.push(ScheduleRow {
                set_at: now.timestamp(),
                start_time: ev.start.timestamp(),
                duration,
                min_duration: lim.min_duration_sec,
            });
        }
    }

    plan
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, m, 0).unwrap()
    }

    fn event(summary: &str, start: DateTime<Utc>, secs: i64) -> CalendarEvent {
        CalendarEvent {
            summary: summary.into(),
            start,
            end: start + Duration::seconds(secs),
        }
    }

    fn limits() -> BTreeMap<i64, DeviceLimits> {
        [101, 201]
            .into_iter()
            .map(|id| {
                (
                    id,
                    DeviceLimits {
                        min_duration_sec: 60,
                        max_duration_sec: 1200,
                    },
                )
            })
            .collect()
    }

    fn cfg() -> CalendarConfig {
        toml::from_str(
            r#"
            calendar_id = "garden@group.calendar.google.com"
            client_id = "id"
            client_secret = "secret"
            "#,
        )
        .unwrap()
    }

    // -- Fake API -------------------------------------------------------------

    #[derive(Default)]
    struct FakeCalendar {
        responses: Mutex<VecDeque<Result<Vec<CalendarEvent>, SyncError>>>,
        list_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
    }

    impl FakeCalendar {
        fn push(&self, r: Result<Vec<CalendarEvent>, SyncError>) {
            self.responses.lock().unwrap().push_back(r);
        }
    }

    impl CalendarApi for FakeCalendar {
        async fn list_events(
            &self,
            _access_token: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<CalendarEvent>, SyncError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn refresh_access_token(&self, _refresh: &str) -> Result<String, SyncError> {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("access-{}", n + 1))
        }
    }

    async fn authed_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.set_tokens(&TokenPair {
            access_token: "access-0".into(),
            refresh_token: "refresh".into(),
        })
        .await
        .unwrap();
        db
    }

    // -- Parsing --------------------------------------------------------------

    #[test]
    fn device_tags() {
        assert_eq!(device_tag("device:101"), Some(101));
        assert_eq!(device_tag("device: 202 "), Some(202));
        assert_eq!(device_tag("dentist:3"), None);
        assert_eq!(device_tag("device:front"), None);
        assert_eq!(device_tag("device"), None);
    }

    #[test]
    fn parse_events_skips_all_day_entries() {
        let body = json!({
            "items": [
                {
                    "summary": "device:101",
                    "start": { "dateTime": "2026-06-01T06:00:00-07:00" },
                    "end": { "dateTime": "2026-06-01T06:10:00-07:00" }
                },
                {
                    "summary": "holiday",
                    "start": { "date": "2026-06-01" },
                    "end": { "date": "2026-06-02" }
                }
            ]
        });
        let events = parse_events(body).unwrap();
        assert_eq!(events, vec![event("device:101", ts(13, 0), 600)]);
    }

    #[test]
    fn parse_events_reports_api_errors() {
        let body = json!({ "error": { "code": 401, "message": "Invalid Credentials" } });
        let err = parse_events(body).unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("Invalid Credentials"));
    }

    #[test]
    fn parse_events_without_items_is_empty() {
        assert!(parse_events(json!({ "kind": "calendar#events" }))
            .unwrap()
            .is_empty());
    }

    // -- Planning -------------------------------------------------------------

    #[test]
    fn todays_rows_filters_clamps_and_covers_all_devices() {
        let now = ts(5, 0);
        let events = [
            event("device:101", ts(6, 0), 600),
            event("device:101", ts(18, 0), 3600),
            event("device:101", ts(6, 0) + Duration::days(1), 600),
            event("device:999", ts(7, 0), 600),
            event("lunch", ts(12, 0), 600),
        ];
        let plan = todays_rows(&Utc, &events, &limits(), now);

        assert_eq!(plan.len(), 2);
        assert!(plan[&201].is_empty());
        let rows = &plan[&101];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].duration, 600);
        assert_eq!(rows[1].duration, 1200);
        assert!(rows.iter().all(|r| r.min_duration == 60 && r.set_at == now.timestamp()));
    }

    // -- Sync behaviour -------------------------------------------------------

    #[tokio::test]
    async fn successful_sync_replaces_schedule_and_persists_time() {
        let db = authed_db().await;
        let status = SystemState::new(&[]).shared();
        let api = FakeCalendar::default();
        let now = Utc::now();
        api.push(Ok(vec![event("device:101", now, 5000)]));

        let mut sync = CalendarSync::new(&cfg(), limits());
        let outcome = sync.refresh_if_due(&api, &db, &status, now).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                devices: 2,
                intervals: 1
            }
        );

        let rows = db.latest_schedule(101, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].duration, 1200);
        assert_eq!(
            db.get_global(LAST_CALENDAR_SYNC).await.unwrap(),
            Some(now.timestamp().to_string())
        );

        // Not due again within the hour.
        let later = now + Duration::minutes(30);
        assert_eq!(
            sync.refresh_if_due(&api, &db, &status, later).await.unwrap(),
            SyncOutcome::NotDue
        );
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_failures_give_up_without_touching_schedule() {
        let db = authed_db().await;
        let kept = ScheduleRow {
            set_at: 1,
            start_time: 1_000,
            duration: 300,
            min_duration: 60,
        };
        db.replace_schedule(101, &[kept]).await.unwrap();

        let status = SystemState::new(&[]).shared();
        let api = FakeCalendar::default();
        for _ in 0..4 {
            api.push(Err(SyncError::Auth(401)));
        }

        let mut sync = CalendarSync::new(&cfg(), limits());
        let mut now = ts(6, 0);
        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(sync.refresh_if_due(&api, &db, &status, now).await.unwrap());
            now = now + Duration::hours(1);
        }
        assert_eq!(
            outcomes,
            vec![
                SyncOutcome::Failed,
                SyncOutcome::Failed,
                SyncOutcome::Failed,
                SyncOutcome::GaveUp
            ]
        );
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 3);
        assert_eq!(db.get_tokens().await.unwrap().unwrap().access_token, "access-3");

        // A fifth call inside the same refresh window does not fetch.
        let again = now - Duration::minutes(30);
        assert_eq!(
            sync.refresh_if_due(&api, &db, &status, again).await.unwrap(),
            SyncOutcome::NotDue
        );
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 4);

        assert_eq!(db.latest_schedule(101, 10).await.unwrap(), vec![kept]);
        assert_eq!(db.get_global(LAST_CALENDAR_SYNC).await.unwrap(), None);
        assert_eq!(sync.status().consecutive_errors, 4);
    }

    #[tokio::test]
    async fn non_auth_errors_refresh_only_on_first_failure() {
        let db = authed_db().await;
        let status = SystemState::new(&[]).shared();
        let api = FakeCalendar::default();
        for _ in 0..2 {
            api.push(Err(SyncError::Decode("bad json".into())));
        }

        let mut sync = CalendarSync::new(&cfg(), limits());
        sync.force(&api, &db, &status, ts(6, 0)).await.unwrap();
        sync.force(&api, &db, &status, ts(7, 0)).await.unwrap();
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);

        // Success resets the counter.
        sync.force(&api, &db, &status, ts(8, 0)).await.unwrap();
        assert_eq!(sync.status().consecutive_errors, 0);
    }

    #[tokio::test]
    async fn missing_tokens_counts_as_failure() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let status = SystemState::new(&[]).shared();
        let api = FakeCalendar::default();

        let mut sync = CalendarSync::new(&cfg(), limits());
        let outcome = sync.force(&api, &db, &status, ts(6, 0)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Failed);
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_resumes_from_last_sync() {
        let db = authed_db().await;
        db.set_global(LAST_CALENDAR_SYNC, &ts(6, 0).timestamp().to_string())
            .await
            .unwrap();

        let sync = CalendarSync::load(&cfg(), limits(), &db).await.unwrap();
        assert!(!sync.is_due(ts(6, 30)));
        assert!(sync.is_due(ts(7, 0)));
        assert_eq!(sync.status().last_sync, Some(ts(6, 0)));
    }

    #[tokio::test]
    async fn cleared_sync_time_makes_running_sync_due() {
        let db = authed_db().await;
        let status = SystemState::new(&[]).shared();
        let api = FakeCalendar::default();

        let mut sync = CalendarSync::new(&cfg(), limits());
        sync.refresh_if_due(&api, &db, &status, ts(6, 0)).await.unwrap();
        assert_eq!(
            sync.refresh_if_due(&api, &db, &status, ts(6, 10)).await.unwrap(),
            SyncOutcome::NotDue
        );

        request_resync(&db).await.unwrap();
        let outcome = sync.refresh_if_due(&api, &db, &status, ts(6, 20)).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sync_by_another_process_is_adopted() {
        let db = authed_db().await;
        let status = SystemState::new(&[]).shared();
        let api = FakeCalendar::default();

        let mut sync = CalendarSync::new(&cfg(), limits());
        db.set_global(LAST_CALENDAR_SYNC, &ts(6, 0).timestamp().to_string())
            .await
            .unwrap();
        assert_eq!(
            sync.refresh_if_due(&api, &db, &status, ts(6, 30)).await.unwrap(),
            SyncOutcome::NotDue
        );
        assert_eq!(sync.status().last_sync, Some(ts(6, 0)));
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn auth_url_carries_client_id() {
        let url = GoogleCalendar::new(cfg()).auth_url().unwrap();
        assert!(url.starts_with("https://accounts.google.com/"));
        assert!(url.contains("client_id=id"));
        assert!(url.contains("access_type=offline"));
    }
}
