use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Key in `kv_globals` holding the epoch second of the last successful
/// calendar sync.
pub const LAST_CALENDAR_SYNC: &str = "last_calendar_sync";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DeviceRecord {
    pub device_id: i64,
    pub group_id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub device_type: String,
    pub display_name: String,
    pub pin: i64,
}

/// One on/off transition of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromRow)]
pub struct HistoryEvent {
    pub timestamp: i64,
    pub device_id: i64,
    pub enabled: bool,
}

/// A stored schedule interval. `start_time` is epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromRow)]
pub struct ScheduleRow {
    pub set_at: i64,
    pub start_time: i64,
    pub duration: i64,
    pub min_duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/pi-timer/db.sqlite"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // Every connection to `:memory:` is its own database, so keep exactly one.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn upsert_device(&self, d: &DeviceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, group_id, type, display_name, pin)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              group_id=excluded.group_id,
              type=excluded.type,
              display_name=excluded.display_name,
              pin=excluded.pin
            "#,
        )
        .bind(d.device_id)
        .bind(d.group_id)
        .bind(&d.device_type)
        .bind(&d.display_name)
        .bind(d.pin)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT device_id, group_id, type, display_name, pin
            FROM devices
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list_devices failed")
    }

    pub async fn get_device(&self, device_id: i64) -> Result<Option<DeviceRecord>> {
        sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT device_id, group_id, type, display_name, pin
            FROM devices
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")
    }

    // ----------------------------
    // Device history (event store)
    // ----------------------------

    pub async fn record_event(&self, device_id: i64, enabled: bool, timestamp: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_history (timestamp, device_id, enabled)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(timestamp)
        .bind(device_id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .with_context(|| format!("record_event failed for device {device_id}"))?;
        Ok(())
    }

    /// Events for a device strictly after `since`, oldest first. Events sharing
    /// a timestamp come back in insertion order.
    pub async fn history(&self, device_id: i64, since: i64) -> Result<Vec<HistoryEvent>> {
        sqlx::query_as::<_, HistoryEvent>(
            r#"
            SELECT timestamp, device_id, enabled
            FROM device_history
            WHERE device_id = ? AND timestamp > ?
            ORDER BY timestamp, rowid
            "#,
        )
        .bind(device_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("history failed for device {device_id}"))
    }

    pub async fn clear_history(&self, device_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM device_history WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("clear_history failed")?;
        Ok(res.rows_affected())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    /// Append one interval; it becomes the newest entry for the device.
    pub async fn add_schedule(&self, device_id: i64, row: &ScheduleRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_schedule (set_at, device_id, start_time, duration, min_duration)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.set_at)
        .bind(device_id)
        .bind(row.start_time)
        .bind(row.duration)
        .bind(row.min_duration)
        .execute(&self.pool)
        .await
        .context("add_schedule failed")?;
        Ok(())
    }

    /// Replace every stored interval of a device in one transaction.
    pub async fn replace_schedule(&self, device_id: i64, rows: &[ScheduleRow]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("replace_schedule: begin failed")?;

        sqlx::query("DELETE FROM device_schedule WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .context("replace_schedule: delete failed")?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO device_schedule (set_at, device_id, start_time, duration, min_duration)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.set_at)
            .bind(device_id)
            .bind(row.start_time)
            .bind(row.duration)
            .bind(row.min_duration)
            .execute(&mut *tx)
            .await
            .context("replace_schedule: insert failed")?;
        }

        tx.commit().await.context("replace_schedule: commit failed")?;
        Ok(())
    }

    /// Up to `limit` intervals, most recently set first; intervals set together
    /// are ordered by start time.
    pub async fn latest_schedule(&self, device_id: i64, limit: i64) -> Result<Vec<ScheduleRow>> {
        sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT set_at, start_time, duration, min_duration
            FROM device_schedule
            WHERE device_id = ?
            ORDER BY set_at DESC, start_time ASC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("latest_schedule failed for device {device_id}"))
    }

    pub async fn clear_schedule(&self, device_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM device_schedule WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("clear_schedule failed")?;
        Ok(res.rows_affected())
    }

    // ----------------------------
    // OAuth tokens
    // ----------------------------

    pub async fn get_tokens(&self) -> Result<Option<TokenPair>> {
        sqlx::query_as::<_, TokenPair>(
            "SELECT access_token, refresh_token FROM oauth_tokens WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("get_tokens failed")
    }

    pub async fn set_tokens(&self, tokens: &TokenPair) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (id, access_token, refresh_token)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              access_token=excluded.access_token,
              refresh_token=excluded.refresh_token
            "#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .execute(&self.pool)
        .await
        .context("set_tokens failed")?;
        Ok(())
    }

    // ----------------------------
    // Globals
    // ----------------------------

    pub async fn get_global(&self, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_globals WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get_global failed: {name}"))?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_global(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_globals (name, value) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value=excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("set_global failed: {name}"))?;
        Ok(())
    }

    /// Returns whether the key existed.
    pub async fn delete_global(&self, name: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM kv_globals WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete_global failed: {name}"))?;
        Ok(res.rows_affected() > 0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
