//! TOML config file loading, validation, and database seeding for devices,
//! plus the environment-provided runtime settings.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::env;

use crate::calendar::DeviceLimits;
use crate::db::{Db, DeviceRecord};
use crate::engine::MAX_DURATION_SECS;
use crate::schedule::ScheduleSource;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    pub calendar: Option<CalendarConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Upper bound on the sleep between control cycles.
    #[serde(default = "default_max_poll_sec")]
    pub max_poll_sec: i64,
    /// Longest single wait before the watchdog is pulsed again.
    #[serde(default = "default_watchdog_pulse_ms")]
    pub watchdog_pulse_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_poll_sec: default_max_poll_sec(),
            watchdog_pulse_ms: default_watchdog_pulse_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    pub calendar_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_refresh_interval_sec")]
    pub refresh_interval_sec: i64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device_id: i64,
    pub group_id: i64,
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,
    pub display_name: String,
    pub pin: i64,
    #[serde(default = "default_schedule")]
    pub schedule: ScheduleSource,
}

fn default_max_poll_sec() -> i64 {
    60
}
fn default_watchdog_pulse_ms() -> u64 {
    1000
}
fn default_refresh_interval_sec() -> i64 {
    60 * 60
}
fn default_max_consecutive_errors() -> u32 {
    3
}
fn default_api_base() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}
fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}
fn default_device_type() -> String {
    "valve".to_string()
}
fn default_schedule() -> ScheduleSource {
    ScheduleSource::None
}

impl DeviceEntry {
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            device_id: self.device_id,
            group_id: self.group_id,
            device_type: self.device_type.clone(),
            display_name: self.display_name.clone(),
            pin: self.pin,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_daemon(&mut errors);
        self.validate_calendar(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Clamp bounds for every calendar-scheduled device.
    pub fn calendar_limits(&self) -> BTreeMap<i64, DeviceLimits> {
        self.devices
            .iter()
            .filter_map(|d| match d.schedule {
                ScheduleSource::Calendar {
                    min_duration_sec,
                    max_duration_sec,
                } => Some((
                    d.device_id,
                    DeviceLimits {
                        min_duration_sec,
                        max_duration_sec,
                    },
                )),
                _ => None,
            })
            .collect()
    }

    fn validate_daemon(&self, errors: &mut Vec<String>) {
        if self.daemon.max_poll_sec < 1 {
            errors.push(format!(
                "daemon: max_poll_sec must be at least 1, got {}",
                self.daemon.max_poll_sec
            ));
        }
        if self.daemon.watchdog_pulse_ms == 0 {
            errors.push("daemon: watchdog_pulse_ms must be positive".to_string());
        }
    }

    fn validate_calendar(&self, errors: &mut Vec<String>) {
        let Some(c) = &self.calendar else {
            if !self.calendar_limits().is_empty() {
                errors.push(
                    "calendar: section is required when a device uses a calendar schedule"
                        .to_string(),
                );
            }
            return;
        };

        if c.calendar_id.trim().is_empty() {
            errors.push("calendar: calendar_id is empty".to_string());
        }
        if c.client_id.trim().is_empty() {
            errors.push("calendar: client_id is empty".to_string());
        }
        if c.refresh_interval_sec <= 0 {
            errors.push(format!(
                "calendar: refresh_interval_sec must be positive, got {}",
                c.refresh_interval_sec
            ));
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id <= 0 {
                    format!("devices[{i}]")
                } else {
                    format!("device {}", d.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.device_id <= 0 {
                errors.push(format!("{}: device_id must be positive", ctx()));
            } else if !seen_ids.insert(d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.group_id <= 0 {
                errors.push(format!(
                    "{}: group_id must be positive, got {}",
                    ctx(),
                    d.group_id
                ));
            }

            if d.display_name.trim().is_empty() {
                errors.push(format!("{}: display_name is empty", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&d.pin) {
                errors.push(format!(
                    "{}: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    d.pin
                ));
            } else if !seen_pins.insert(d.pin) {
                errors.push(format!(
                    "{}: pin {} is already used by another device",
                    ctx(),
                    d.pin
                ));
            }

            // ── Schedule ────────────────────────────────────────
            match &d.schedule {
                ScheduleSource::None => {}
                ScheduleSource::Static {
                    hour,
                    minute,
                    duration_sec,
                    min_duration_sec,
                } => {
                    if *hour > 23 {
                        errors.push(format!("{}: hour {hour} out of range [0, 23]", ctx()));
                    }
                    if *minute > 59 {
                        errors.push(format!("{}: minute {minute} out of range [0, 59]", ctx()));
                    }
                    check_durations(
                        errors,
                        &ctx(),
                        "duration_sec",
                        *min_duration_sec,
                        *duration_sec,
                    );
                }
                ScheduleSource::Persisted { latest } => {
                    if *latest < 1 {
                        errors.push(format!("{}: latest must be at least 1, got {latest}", ctx()));
                    }
                }
                ScheduleSource::Calendar {
                    min_duration_sec,
                    max_duration_sec,
                } => {
                    check_durations(
                        errors,
                        &ctx(),
                        "max_duration_sec",
                        *min_duration_sec,
                        *max_duration_sec,
                    );
                }
            }
        }
    }
}

fn check_durations(errors: &mut Vec<String>, ctx: &str, name: &str, min: i64, max: i64) {
    if max <= 0 {
        errors.push(format!("{ctx}: {name} must be positive, got {max}"));
    }
    if min < 0 {
        errors.push(format!("{ctx}: min_duration_sec must not be negative, got {min}"));
    }
    if max > MAX_DURATION_SECS {
        errors.push(format!(
            "{ctx}: {name} must be at most {MAX_DURATION_SECS}, got {max}"
        ));
    }
    if min > max {
        errors.push(format!(
            "{ctx}: min_duration_sec ({min}) exceeds {name} ({max})"
        ));
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert every configured device into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for d in &config.devices {
        db.upsert_device(&d.record())
            .await
            .with_context(|| format!("failed to upsert device {}", d.device_id))?;
    }

    tracing::info!(devices = config.devices.len(), "config applied");

    Ok(())
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Runtime settings taken from the environment rather than the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Env {
    pub db_url: String,
    pub config_path: String,
    pub web_port: u16,
    /// Many common relay boards are active-low. If yours is active-high, set
    /// `RELAY_ACTIVE_LOW=false`.
    pub relay_active_low: bool,
    pub watchdog_device: Option<String>,
    pub log_file: Option<String>,
}

impl Env {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        Self {
            db_url: non_empty("DB_URL")
                .unwrap_or_else(|| "sqlite:pi-timer.db?mode=rwc".to_string()),
            config_path: non_empty("CONFIG_PATH").unwrap_or_else(|| "config.toml".to_string()),
            web_port: non_empty("WEB_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            relay_active_low: non_empty("RELAY_ACTIVE_LOW")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            watchdog_device: non_empty("WATCHDOG_DEVICE"),
            log_file: non_empty("LOG_FILE"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
