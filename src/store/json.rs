//! JSON file store (`~/.exposure-status/status.json`).

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::StatusStore;
use crate::error::StoreError;
use crate::types::PersistedStatus;

pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StatusStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedStatus>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write to a sibling temp file, then rename over the target.
    fn save(&self, status: &PersistedStatus) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let content = serde_json::to_string_pretty(status)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NotificationRecord, RiskLevel, SourceId, SourceState};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("status.json"));
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn test_save_creates_parent_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("nested").join("status.json"));
        let at = Utc.with_ymd_and_hms(2024, 8, 8, 8, 0, 0).unwrap();

        let mut status = PersistedStatus {
            current_level: RiskLevel::scored(4.0, at),
            notification: NotificationRecord {
                last_notified_level: Some(4.0),
                last_notified_at: Some(at),
            },
            last_refreshed_at: Some(at),
            ..PersistedStatus::default()
        };
        status.sources.insert(
            SourceId::VenueWarning,
            SourceState {
                last_attempt_at: Some(at),
                consecutive_failures: 2,
                ..SourceState::default()
            },
        );

        store.save(&status).expect("save");
        assert_eq!(store.load().expect("load"), Some(status));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Serialize(_))));
    }
}
