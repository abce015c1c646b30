use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::db::DeviceRecord;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// In-memory view of the daemon for the status API. Nothing here drives
/// decisions; it only mirrors what the control loop did.
pub struct SystemState {
    pub started_at: Instant,
    pub devices: BTreeMap<i64, DeviceStatus>,
    pub calendar: Option<CalendarStatus>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct DeviceStatus {
    pub display_name: String,
    pub group_id: i64,
    pub pin: i64,
    pub schedule: &'static str,
    pub on: bool,
    pub last_changed: Option<DateTime<Utc>>,
}

#[derive(Clone, Default, Serialize)]
pub struct CalendarStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Device,
    Lock,
    Sync,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub devices: BTreeMap<i64, DeviceStatus>,
    pub calendar: Option<CalendarStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(devices: &[(DeviceRecord, &'static str)]) -> Self {
        let devices = devices
            .iter()
            .map(|(rec, schedule)| {
                (
                    rec.device_id,
                    DeviceStatus {
                        display_name: rec.display_name.clone(),
                        group_id: rec.group_id,
                        pin: rec.pin,
                        schedule: *schedule,
                        on: false,
                        last_changed: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            devices,
            calendar: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Record a device turning on or off.
    pub fn record_device(&mut self, device_id: i64, on: bool) {
        let name = match self.devices.get_mut(&device_id) {
            Some(d) => {
                d.on = on;
                d.last_changed = Some(Utc::now());
                d.display_name.clone()
            }
            None => device_id.to_string(),
        };

        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Device, format!("{name} ({device_id}) turned {state_str}"));
    }

    /// Record a device deferred by its group lock.
    pub fn record_lock_wait(&mut self, device_id: i64, holder: i64) {
        self.push_event(
            EventKind::Lock,
            format!("device {device_id} waiting on {holder} for group lock"),
        );
    }

    pub fn record_sync(&mut self, status: CalendarStatus, detail: String) {
        self.calendar = Some(status);
        self.push_event(EventKind::Sync, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            devices: self.devices.clone(),
            calendar: self.calendar.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn front() -> DeviceRecord {
        DeviceRecord {
            device_id: 101,
            group_id: 1000,
            device_type: "valve".into(),
            display_name: "Front sprinklers".into(),
            pin: 18,
        }
    }

    #[test]
    fn record_device_updates_status_and_logs() {
        let mut st = SystemState::new(&[(front(), "static")]);
        st.record_device(101, true);

        let d = &st.devices[&101];
        assert!(d.on);
        assert!(d.last_changed.is_some());
        assert_eq!(st.events.len(), 1);
        assert_eq!(st.events[0].kind, EventKind::Device);
        assert!(st.events[0].detail.contains("turned ON"));
    }

    #[test]
    fn unknown_device_still_logged() {
        let mut st = SystemState::new(&[]);
        st.record_device(7, false);
        assert!(st.devices.is_empty());
        assert_eq!(st.events[0].detail, "7 (7) turned OFF");
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new(&[]);
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new(&[(front(), "static")]);
        st.record_system("first".into());
        st.record_system("second".into());
        let status = st.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.devices.len(), 1);
    }
}
