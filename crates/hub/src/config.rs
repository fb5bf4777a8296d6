//! TOML config file loading, validation, and environment overrides.
//!
//! Every field has a default, so the file itself is optional.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use time::{Duration, UtcOffset};

use crate::clock::{parse_utc_offset, DEFAULT_UTC_OFFSET};

/// One day; longer windows or timeouts make no sense for a daily schedule.
const MAX_GRACE_WINDOW_MIN: i64 = 24 * 60;
const MAX_OFFLINE_TIMEOUT_SEC: i64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub scheduler: SchedulerSection,
    pub storage: StorageSection,
    pub web: WebSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub status_topic: String,
    pub command_topic: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_sec: u64,
    pub offline_timeout_sec: i64,
    pub grace_window_min: i64,
    pub utc_offset: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub state_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: "aquarium-hub".to_string(),
            status_topic: "aquarium/tank/status".to_string(),
            command_topic: "aquarium/tank/command".to_string(),
            keep_alive_secs: 10,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_sec: 1,
            offline_timeout_sec: 30,
            grace_window_min: 10,
            utc_offset: DEFAULT_UTC_OFFSET.to_string(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("fish_config.json"),
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl SchedulerSection {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_sec)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::seconds(self.offline_timeout_sec)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::minutes(self.grace_window_min)
    }

    pub fn offset(&self) -> Result<UtcOffset> {
        parse_utc_offset(&self.utc_offset)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_scheduler(&mut errors);

        if self.storage.state_path.as_os_str().is_empty() {
            errors.push("storage: state_path is empty".to_string());
        }

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

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.broker_host.trim().is_empty() {
            errors.push("mqtt: broker_host is empty".to_string());
        }
        if m.broker_port == 0 {
            errors.push("mqtt: broker_port must be non-zero".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".to_string());
        }
        if m.keep_alive_secs < 5 {
            errors.push(format!(
                "mqtt: keep_alive_secs must be at least 5, got {}",
                m.keep_alive_secs
            ));
        }

        for (name, topic) in [("status_topic", &m.status_topic), ("command_topic", &m.command_topic)] {
            if topic.trim().is_empty() {
                errors.push(format!("mqtt: {name} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!("mqtt: {name} '{topic}' must not contain wildcards"));
            }
        }
        if !m.status_topic.is_empty() && m.status_topic == m.command_topic {
            errors.push("mqtt: status_topic and command_topic must differ".to_string());
        }
    }

    fn validate_scheduler(&self, errors: &mut Vec<String>) {
        let s = &self.scheduler;

        if s.tick_interval_sec == 0 {
            errors.push("scheduler: tick_interval_sec must be positive, got 0".to_string());
        }
        if s.offline_timeout_sec <= 0 {
            errors.push(format!(
                "scheduler: offline_timeout_sec must be positive, got {}",
                s.offline_timeout_sec
            ));
        } else if s.offline_timeout_sec > MAX_OFFLINE_TIMEOUT_SEC {
            errors.push(format!(
                "scheduler: offline_timeout_sec must be at most {MAX_OFFLINE_TIMEOUT_SEC}, got {}",
                s.offline_timeout_sec
            ));
        }

        let grace_sec = if s.grace_window_min <= 0 {
            errors.push(format!(
                "scheduler: grace_window_min must be positive, got {}",
                s.grace_window_min
            ));
            None
        } else if s.grace_window_min > MAX_GRACE_WINDOW_MIN {
            errors.push(format!(
                "scheduler: grace_window_min must be at most {MAX_GRACE_WINDOW_MIN}, got {}",
                s.grace_window_min
            ));
            None
        } else {
            (s.grace_window_min as u64).checked_mul(60)
        };

        // A slot must get at least one tick inside its window.
        if let Some(grace_sec) = grace_sec {
            if s.tick_interval_sec > 0 && s.tick_interval_sec >= grace_sec {
                errors.push(format!(
                    "scheduler: tick_interval_sec ({}) must be shorter than grace_window_min ({}) in seconds",
                    s.tick_interval_sec, s.grace_window_min
                ));
            }
        }

        if let Err(e) = parse_utc_offset(&s.utc_offset) {
            errors.push(format!("scheduler: {e} (expected e.g. \"+07:00\")"));
        }
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            self.mqtt.broker_port = port;
        }
        if let Ok(path) = env::var("STATE_PATH") {
            self.storage.state_path = PathBuf::from(path);
        }
        if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file (a missing file means all defaults),
/// apply environment overrides, then validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no config file, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };

    config.apply_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
