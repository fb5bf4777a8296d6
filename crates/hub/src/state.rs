use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use time::{Duration, OffsetDateTime};

use crate::schedule::ScheduleConfig;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Device status values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpStatus {
    Off,
    On,
    Unknown,
}

impl PumpStatus {
    /// Normalise a telemetry string (trimmed, case-insensitive).
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Self::On,
            "OFF" => Self::Off,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeederStatus {
    Ready,
    On,
    Off,
    Unknown,
}

impl FeederStatus {
    /// Normalise a telemetry string (trimmed, case-insensitive).
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "READY" => Self::Ready,
            "ON" => Self::On,
            "OFF" => Self::Off,
            _ => Self::Unknown,
        }
    }
}

/// The fields a single status message may carry. Absent fields leave the
/// current value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub sensor_value: Option<i64>,
    pub pump_status: Option<PumpStatus>,
    pub feeder_status: Option<FeederStatus>,
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Last known device snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub sensor_value: i64,
    pub pump_status: PumpStatus,
    pub feeder_status: FeederStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            sensor_value: 0,
            pump_status: PumpStatus::Unknown,
            feeder_status: FeederStatus::Unknown,
            last_seen: None,
        }
    }
}

impl DeviceState {
    /// Apply the fields present in `update` and mark the device seen at `at`.
    pub fn merge(&mut self, update: &StatusUpdate, at: OffsetDateTime) {
        if let Some(v) = update.sensor_value {
            self.sensor_value = v;
        }
        if let Some(p) = update.pump_status {
            self.pump_status = p;
        }
        if let Some(f) = update.feeder_status {
            self.feeder_status = f;
        }
        self.touch(at);
    }

    /// Move `last_seen` forward to `at`. Never moves it backward.
    pub fn touch(&mut self, at: OffsetDateTime) {
        match self.last_seen {
            Some(prev) if prev >= at => {}
            _ => self.last_seen = Some(at),
        }
    }
}

pub struct SystemState {
    pub started_at: Instant,
    pub channel_connected: bool,
    pub device: DeviceState,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Scheduler,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Read snapshot (what presentation layers see)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub now: OffsetDateTime,
    pub online: bool,
    pub channel_connected: bool,
    /// Milliseconds since the last status message, if any arrived yet.
    pub last_seen_age_ms: Option<i64>,
    pub device: DeviceState,
    pub schedule: ScheduleConfig,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            channel_connected: false,
            device: DeviceState::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// `online = connected && now - last_seen < offline_timeout`. Recomputed
    /// on every call, never cached.
    pub fn is_online(&self, now: OffsetDateTime, offline_timeout: Duration) -> bool {
        if !self.channel_connected {
            return false;
        }
        match self.device.last_seen {
            Some(seen) => now - seen < offline_timeout,
            None => false,
        }
    }

    /// Merge a parsed status message.
    pub fn record_status(&mut self, update: &StatusUpdate, at: OffsetDateTime) {
        self.device.merge(update, at);

        let mut parts = Vec::new();
        if let Some(v) = update.sensor_value {
            parts.push(format!("sensor={v}"));
        }
        if let Some(p) = update.pump_status {
            parts.push(format!("pump={p:?}"));
        }
        if let Some(f) = update.feeder_status {
            parts.push(format!("feeder={f:?}"));
        }
        if parts.is_empty() {
            parts.push("heartbeat".to_string());
        }
        self.push_event(EventKind::Telemetry, parts.join(", "));
    }

    /// A status message arrived but could not be parsed. The link is still
    /// alive, so only `last_seen` moves.
    pub fn record_malformed(&mut self, at: OffsetDateTime) {
        self.device.touch(at);
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.channel_connected != connected {
            self.channel_connected = connected;
            let detail = if connected {
                "broker connected"
            } else {
                "broker disconnected"
            };
            self.push_event(EventKind::System, detail.to_string());
        }
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(
        &self,
        now: OffsetDateTime,
        offline_timeout: Duration,
        schedule: &ScheduleConfig,
    ) -> StatusSnapshot {
        StatusSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            now,
            online: self.is_online(now, offline_timeout),
            channel_connected: self.channel_connected,
            last_seen_age_ms: self
                .device
                .last_seen
                .map(|seen| (now - seen).whole_milliseconds() as i64),
            device: self.device.clone(),
            schedule: schedule.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const TIMEOUT: Duration = Duration::seconds(30);

    fn t0() -> OffsetDateTime {
        datetime!(2024-06-01 08:00:00 +7)
    }

    // -- status normalisation -----------------------------------------------

    #[test]
    fn pump_status_from_wire() {
        assert_eq!(PumpStatus::from_wire("on"), PumpStatus::On);
        assert_eq!(PumpStatus::from_wire(" OFF "), PumpStatus::Off);
        assert_eq!(PumpStatus::from_wire("running"), PumpStatus::Unknown);
    }

    #[test]
    fn feeder_status_from_wire() {
        assert_eq!(FeederStatus::from_wire("ready"), FeederStatus::Ready);
        assert_eq!(FeederStatus::from_wire("On"), FeederStatus::On);
        assert_eq!(FeederStatus::from_wire("off"), FeederStatus::Off);
        assert_eq!(FeederStatus::from_wire(""), FeederStatus::Unknown);
    }

    #[test]
    fn statuses_serialize_uppercase() {
        assert_eq!(serde_json::to_value(PumpStatus::On).unwrap(), "ON");
        assert_eq!(serde_json::to_value(FeederStatus::Ready).unwrap(), "READY");
    }

    // -- merge --------------------------------------------------------------

    #[test]
    fn partial_merge_touches_only_present_fields() {
        let mut dev = DeviceState {
            sensor_value: 180,
            pump_status: PumpStatus::Off,
            feeder_status: FeederStatus::Ready,
            last_seen: Some(t0()),
        };
        let update = StatusUpdate {
            pump_status: Some(PumpStatus::On),
            ..StatusUpdate::default()
        };
        let at = t0() + Duration::seconds(5);
        dev.merge(&update, at);

        assert_eq!(dev.pump_status, PumpStatus::On);
        assert_eq!(dev.sensor_value, 180);
        assert_eq!(dev.feeder_status, FeederStatus::Ready);
        assert_eq!(dev.last_seen, Some(at));
    }

    #[test]
    fn full_merge() {
        let mut dev = DeviceState::default();
        dev.merge(
            &StatusUpdate {
                sensor_value: Some(250),
                pump_status: Some(PumpStatus::Off),
                feeder_status: Some(FeederStatus::On),
            },
            t0(),
        );
        assert_eq!(dev.sensor_value, 250);
        assert_eq!(dev.pump_status, PumpStatus::Off);
        assert_eq!(dev.feeder_status, FeederStatus::On);
    }

    #[test]
    fn last_seen_never_moves_backward() {
        let mut dev = DeviceState::default();
        dev.touch(t0());
        dev.touch(t0() - Duration::seconds(10));
        assert_eq!(dev.last_seen, Some(t0()));
        dev.merge(&StatusUpdate::default(), t0() - Duration::minutes(1));
        assert_eq!(dev.last_seen, Some(t0()));
    }

    #[test]
    fn malformed_only_refreshes_last_seen() {
        let mut st = SystemState::new();
        st.record_malformed(t0());
        assert_eq!(st.device.last_seen, Some(t0()));
        assert_eq!(st.device.sensor_value, 0);
        assert_eq!(st.device.pump_status, PumpStatus::Unknown);
    }

    // -- connectivity -------------------------------------------------------

    #[test]
    fn offline_before_any_message() {
        let mut st = SystemState::new();
        st.set_connected(true);
        assert!(!st.is_online(t0(), TIMEOUT));
    }

    #[test]
    fn online_when_connected_and_fresh() {
        let mut st = SystemState::new();
        st.set_connected(true);
        st.record_status(&StatusUpdate::default(), t0());
        assert!(st.is_online(t0() + Duration::seconds(29), TIMEOUT));
    }

    #[test]
    fn offline_when_stale() {
        let mut st = SystemState::new();
        st.set_connected(true);
        st.record_status(&StatusUpdate::default(), t0());
        assert!(!st.is_online(t0() + Duration::seconds(30), TIMEOUT));
    }

    #[test]
    fn offline_when_disconnected_even_if_fresh() {
        let mut st = SystemState::new();
        st.set_connected(true);
        st.record_status(&StatusUpdate::default(), t0());
        st.set_connected(false);
        assert!(!st.is_online(t0(), TIMEOUT));
    }

    // -- events -------------------------------------------------------------

    #[test]
    fn connection_events_only_on_change() {
        let mut st = SystemState::new();
        st.set_connected(true);
        st.set_connected(true);
        st.set_connected(false);
        assert_eq!(st.events.len(), 2);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn snapshot_lists_newest_event_first() {
        let mut st = SystemState::new();
        st.set_connected(true);
        st.record_status(
            &StatusUpdate {
                sensor_value: Some(120),
                ..StatusUpdate::default()
            },
            t0(),
        );

        let snap = st.to_status(t0() + Duration::seconds(2), TIMEOUT, &ScheduleConfig::default());
        assert!(snap.online);
        assert_eq!(snap.last_seen_age_ms, Some(2000));
        assert_eq!(snap.events[0].kind, EventKind::Telemetry);
        assert_eq!(snap.events[0].detail, "sensor=120");

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["device"]["sensor_value"], 120);
        assert_eq!(json["device"]["pump_status"], "UNKNOWN");
        assert_eq!(json["events"][1]["kind"], "system");
    }
}
