//! JSON file persistence for the feeding schedule.
//!
//! The state file may also carry keys that belong to other tools (tokens, UI
//! preferences). Saving is therefore read-merge-write: only the schedule keys
//! are replaced and everything else is written back untouched. Writes go to a
//! sibling temp file which is then renamed over the target, so a crash never
//! leaves a truncated file behind.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::schedule::ScheduleConfig;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read state file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write state file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize schedule")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the schedule. A missing, unreadable or corrupt file yields the
    /// built-in defaults; this never fails.
    pub fn load(&self) -> ScheduleConfig {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no schedule state file, using defaults");
                return ScheduleConfig::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read schedule state: {e}, using defaults");
                return ScheduleConfig::default();
            }
        };

        match serde_json::from_str::<ScheduleConfig>(&contents) {
            Ok(cfg) => {
                info!(
                    path = %self.path.display(),
                    enabled = cfg.auto_feed_enabled,
                    slots = cfg.feed_times.len(),
                    triggered = cfg.triggered_today.len(),
                    "schedule loaded"
                );
                cfg
            }
            Err(e) => {
                warn!(path = %self.path.display(), "corrupt schedule state: {e}, using defaults");
                ScheduleConfig::default()
            }
        }
    }

    /// Persist `cfg`, keeping any unrelated keys already in the file.
    pub fn save(&self, cfg: &ScheduleConfig) -> Result<(), StoreError> {
        let mut doc = self.read_document()?;
        if let Value::Object(fields) = serde_json::to_value(cfg)? {
            doc.extend(fields);
        }

        let bytes = serde_json::to_vec_pretty(&Value::Object(doc))?;
        write_atomic(&self.path, &bytes).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), "schedule saved");
        Ok(())
    }

    /// Current file contents as a JSON object, or an empty object when the
    /// file is absent or not a JSON object. Any other read failure is an
    /// error: writing anyway would drop keys we could not see.
    fn read_document(&self) -> Result<Map<String, Value>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "state file is not a JSON object, rewriting it");
                Ok(Map::new())
            }
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::SlotTime;
    use time::macros::date;

    fn slot(s: &str) -> SlotTime {
        s.parse().unwrap()
    }

    fn sample_config() -> ScheduleConfig {
        ScheduleConfig {
            auto_feed_enabled: true,
            feed_times: vec![slot("08:00"), slot("12:30"), slot("19:45")],
            triggered_today: ["08:00".to_string()].into(),
            last_check_date: Some(date!(2024 - 06 - 01)),
        }
    }

    // -- load ---------------------------------------------------------------

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("fish_config.json"));
        assert_eq!(store.load(), ScheduleConfig::default());
    }

    #[test]
    fn load_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fish_config.json");
        fs::write(&path, b"{ not json").unwrap();
        assert_eq!(ScheduleStore::new(&path).load(), ScheduleConfig::default());
    }

    #[test]
    fn load_invalid_slot_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fish_config.json");
        fs::write(&path, br#"{"auto_feed_enabled": true, "feed_times": ["99:99"]}"#).unwrap();
        assert_eq!(ScheduleStore::new(&path).load(), ScheduleConfig::default());
    }

    // -- save ---------------------------------------------------------------

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("fish_config.json"));

        let cfg = sample_config();
        store.save(&cfg).unwrap();
        assert_eq!(store.load(), cfg);
    }

    #[test]
    fn save_preserves_sibling_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fish_config.json");
        fs::write(
            &path,
            br#"{"input_mode": "Text", "credentials": {"user": "tank", "token": "abc"}, "auto_feed_enabled": false}"#,
        )
        .unwrap();

        let store = ScheduleStore::new(&path);
        store.save(&sample_config()).unwrap();

        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["input_mode"], "Text");
        assert_eq!(doc["credentials"]["token"], "abc");
        assert_eq!(doc["auto_feed_enabled"], true);
        assert_eq!(doc["feed_times"], serde_json::json!(["08:00", "12:30", "19:45"]));
        assert_eq!(doc["triggered_today"], serde_json::json!(["08:00"]));
        assert_eq!(doc["last_check_date"], "2024-06-01");

        // and a second save still keeps them
        store.save(&ScheduleConfig::default()).unwrap();
        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["credentials"]["user"], "tank");
        assert!(doc["last_check_date"].is_null());
    }

    #[test]
    fn save_replaces_non_object_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fish_config.json");
        fs::write(&path, b"[1, 2, 3]").unwrap();

        let store = ScheduleStore::new(&path);
        store.save(&sample_config()).unwrap();
        assert_eq!(store.load(), sample_config());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("fish_config.json"));
        store.save(&sample_config()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["fish_config.json".to_string()]);
    }

    #[test]
    fn save_refuses_to_overwrite_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the state path cannot be read as a file.
        let path = dir.path().join("fish_config.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        let err = ScheduleStore::new(&path).save(&sample_config()).unwrap_err();

        assert!(matches!(err, StoreError::Read { .. }));
        assert!(err.to_string().contains("failed to read state file"));
        assert!(path.join("keep").exists());
        assert!(!dir.path().join("fish_config.json.tmp").exists());
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("nope").join("fish_config.json"));
        let err = store.save(&sample_config()).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(err.to_string().contains("fish_config.json"));
    }
}
