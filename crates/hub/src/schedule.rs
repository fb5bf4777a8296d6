//! Persisted feeding schedule: time-of-day slots, the enable flag, and the
//! record of which slots already fired today.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Time};

use crate::store::StoreError;

/// Upper bound on configured slots, enforced when the slot list is edited.
pub const MAX_SLOTS: usize = 10;

/// Lower bound on configured slots, enforced when the slot list is edited.
pub const MIN_SLOTS: usize = 1;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("at most {MAX_SLOTS} feed slots are allowed, got {0}")]
    TooManySlots(usize),

    #[error("at least {MIN_SLOTS} feed slot is required")]
    NoSlots,

    #[error("failed to persist schedule")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day '{0}' (expected HH:MM)")]
pub struct SlotParseError(String);

// ---------------------------------------------------------------------------
// SlotTime
// ---------------------------------------------------------------------------

/// A time of day with minute resolution. Prints as canonical `HH:MM`, which is
/// also the key stored in `triggered_today`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotTime {
    hour: u8,
    minute: u8,
}

impl SlotTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    pub fn key(self) -> String {
        self.to_string()
    }

    pub fn as_time(self) -> Time {
        Time::from_hms(self.hour, self.minute, 0).unwrap_or(Time::MIDNIGHT)
    }
}

impl Default for SlotTime {
    fn default() -> Self {
        Self { hour: 8, minute: 0 }
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for SlotTime {
    type Err = SlotParseError;

    /// Accepts `HH:MM` and `H:MM`. Seconds are not accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SlotParseError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;

        let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
        if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
            return Err(err());
        }

        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for SlotTime {
    type Error = SlotParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SlotTime> for String {
    fn from(t: SlotTime) -> Self {
        t.to_string()
    }
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

/// Schedule state as it appears in the persisted JSON file.
///
/// `triggered_today` holds raw keys rather than `SlotTime`s so entries left
/// over from a removed or hand-edited slot load fine and simply never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub auto_feed_enabled: bool,
    #[serde(default = "default_feed_times")]
    pub feed_times: Vec<SlotTime>,
    #[serde(default)]
    pub triggered_today: BTreeSet<String>,
    #[serde(default, with = "iso_date::option")]
    pub last_check_date: Option<Date>,
}

fn default_feed_times() -> Vec<SlotTime> {
    vec![SlotTime::default()]
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            auto_feed_enabled: false,
            feed_times: default_feed_times(),
            triggered_today: BTreeSet::new(),
            last_check_date: None,
        }
    }
}

impl ScheduleConfig {
    pub fn was_triggered(&self, slot: SlotTime) -> bool {
        self.triggered_today.contains(&slot.key())
    }
}

/// Check the slot count bounds applied when an operator edits the list.
pub fn validate_slots(slots: &[SlotTime]) -> Result<(), ScheduleError> {
    if slots.len() < MIN_SLOTS {
        return Err(ScheduleError::NoSlots);
    }
    if slots.len() > MAX_SLOTS {
        return Err(ScheduleError::TooManySlots(slots.len()));
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn slot(s: &str) -> SlotTime {
        s.parse().unwrap()
    }

    // -- SlotTime parsing ---------------------------------------------------

    #[test]
    fn parse_canonical() {
        let t = slot("08:05");
        assert_eq!((t.hour(), t.minute()), (8, 5));
    }

    #[test]
    fn parse_single_digit_hour() {
        assert_eq!(slot("8:05"), slot("08:05"));
    }

    #[test]
    fn parse_trims_whitespace() {
        assert_eq!(slot(" 23:59 "), SlotTime::new(23, 59).unwrap());
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!("24:00".parse::<SlotTime>().is_err());
        assert!("12:60".parse::<SlotTime>().is_err());
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        for s in ["", "0800", "8:5", "08:00:00", "ab:cd", "-1:00", "+8:00", "123:00"] {
            assert!(s.parse::<SlotTime>().is_err(), "{s:?} should not parse");
        }
    }

    #[test]
    fn display_is_zero_padded() {
        assert_eq!(SlotTime::new(7, 3).unwrap().to_string(), "07:03");
        assert_eq!(SlotTime::new(7, 3).unwrap().key(), "07:03");
    }

    #[test]
    fn ordering_follows_time_of_day() {
        assert!(slot("07:59") < slot("08:00"));
        assert!(slot("08:00") < slot("18:00"));
    }

    #[test]
    fn as_time_matches() {
        assert_eq!(slot("18:30").as_time(), time::macros::time!(18:30));
    }

    // -- ScheduleConfig serde -----------------------------------------------

    #[test]
    fn defaults() {
        let cfg = ScheduleConfig::default();
        assert!(!cfg.auto_feed_enabled);
        assert_eq!(cfg.feed_times, vec![slot("08:00")]);
        assert!(cfg.triggered_today.is_empty());
        assert_eq!(cfg.last_check_date, None);
    }

    #[test]
    fn serializes_to_file_shape() {
        let cfg = ScheduleConfig {
            auto_feed_enabled: true,
            feed_times: vec![slot("08:00"), slot("18:30")],
            triggered_today: ["08:00".to_string()].into(),
            last_check_date: Some(date!(2024 - 03 - 09)),
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["auto_feed_enabled"], true);
        assert_eq!(json["feed_times"], serde_json::json!(["08:00", "18:30"]));
        assert_eq!(json["triggered_today"], serde_json::json!(["08:00"]));
        assert_eq!(json["last_check_date"], "2024-03-09");
    }

    #[test]
    fn absent_date_serializes_as_null() {
        let json = serde_json::to_value(ScheduleConfig::default()).unwrap();
        assert!(json["last_check_date"].is_null());
    }

    #[test]
    fn deserialize_ignores_unrelated_keys() {
        let raw = r#"{
            "auto_feed_enabled": true,
            "feed_times": ["7:30"],
            "triggered_today": [],
            "last_check_date": null,
            "input_mode": "Text",
            "api_token": "secret"
        }"#;
        let cfg: ScheduleConfig = serde_json::from_str(raw).unwrap();
        assert!(cfg.auto_feed_enabled);
        assert_eq!(cfg.feed_times, vec![slot("07:30")]);
    }

    #[test]
    fn deserialize_missing_keys_uses_defaults() {
        let cfg: ScheduleConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ScheduleConfig::default());
    }

    #[test]
    fn deserialize_collapses_duplicate_history() {
        let raw = r#"{"triggered_today": ["08:00", "08:00", "gone"]}"#;
        let cfg: ScheduleConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.triggered_today.len(), 2);
        assert!(cfg.was_triggered(slot("08:00")));
    }

    #[test]
    fn deserialize_rejects_bad_slot() {
        let raw = r#"{"feed_times": ["25:00"]}"#;
        assert!(serde_json::from_str::<ScheduleConfig>(raw).is_err());
    }

    #[test]
    fn deserialize_rejects_bad_date() {
        let raw = r#"{"last_check_date": "09/03/2024"}"#;
        assert!(serde_json::from_str::<ScheduleConfig>(raw).is_err());
    }

    // -- validate_slots -----------------------------------------------------

    #[test]
    fn validate_slot_bounds() {
        assert!(matches!(validate_slots(&[]), Err(ScheduleError::NoSlots)));
        validate_slots(&[slot("08:00")]).unwrap();
        validate_slots(&vec![slot("08:00"); MAX_SLOTS]).unwrap();
        assert!(matches!(
            validate_slots(&vec![slot("08:00"); MAX_SLOTS + 1]),
            Err(ScheduleError::TooManySlots(11))
        ));
    }
}
