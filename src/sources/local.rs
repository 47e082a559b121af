//! File-backed collaborators for the CLI.
//!
//! The app feeds these files from its Bluetooth and venue scanning layers:
//! - `proximity.json`: `{ "registered": true, "lastExchangeAt": "..." }`
//! - `checkins.json`: `[ { "payload": "...", "timestamp": "..." } ]`

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ProximityData, VenueCheckin, VenueCheckinStore};
use crate::types::Timestamp;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProximityFile {
    #[serde(default)]
    registered: bool,
    #[serde(default)]
    last_exchange_at: Option<Timestamp>,
}

/// Proximity state read from a JSON file on every call.
pub struct FileProximityData {
    path: PathBuf,
}

impl FileProximityData {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> ProximityFile {
        if !self.path.exists() {
            return ProximityFile::default();
        }
        match fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
        {
            Ok(file) => file,
            Err(e) => {
                log::warn!(
                    "Proximity data: failed to read {}: {}",
                    self.path.display(),
                    e
                );
                ProximityFile::default()
            }
        }
    }
}

impl ProximityData for FileProximityData {
    fn is_registered(&self) -> bool {
        self.read().registered
    }

    fn has_new_data_since(&self, since: Option<Timestamp>) -> bool {
        match (self.read().last_exchange_at, since) {
            (Some(exchange), Some(since)) => exchange > since,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Venue check-ins kept in a JSON array file.
pub struct JsonCheckinStore {
    path: PathBuf,
    // Serializes read-modify-write of the file.
    write_lock: Mutex<()>,
}

impl JsonCheckinStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a visit.
    pub fn record(&self, checkin: VenueCheckin) -> Result<(), String> {
        let _guard = self.write_lock.lock();
        let mut visits = self.load()?;
        visits.push(checkin);
        self.save(&visits)
    }

    fn load(&self) -> Result<Vec<VenueCheckin>, String> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| format!("Failed to read check-ins: {}", e))?;
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse check-ins: {}", e))
    }

    fn save(&self, visits: &[VenueCheckin]) -> Result<(), String> {
        let content = serde_json::to_string_pretty(visits)
            .map_err(|e| format!("Serialize error: {}", e))?;
        fs::write(&self.path, content).map_err(|e| format!("Write error: {}", e))
    }
}

impl VenueCheckinStore for JsonCheckinStore {
    fn checkins(&self) -> Vec<VenueCheckin> {
        self.load().unwrap_or_else(|e| {
            log::warn!("Venue check-ins: {}", e);
            Vec::new()
        })
    }

    fn prune_before(&self, cutoff: Timestamp) -> usize {
        let _guard = self.write_lock.lock();
        let visits = match self.load() {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Venue check-ins: {}", e);
                return 0;
            }
        };
        let before = visits.len();
        let kept: Vec<VenueCheckin> = visits.into_iter().filter(|c| c.timestamp >= cutoff).collect();
        let removed = before - kept.len();
        if removed > 0 {
            if let Err(e) = self.save(&kept) {
                log::warn!("Venue check-ins: failed to prune: {}", e);
                return 0;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 10, 2, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_proximity_file_means_unregistered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = FileProximityData::new(dir.path().join("proximity.json"));
        assert!(!data.is_registered());
        assert!(!data.has_new_data_since(None));
    }

    #[test]
    fn test_proximity_file_exchange_dates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proximity.json");
        fs::write(
            &path,
            r#"{ "registered": true, "lastExchangeAt": "2024-10-02T10:00:00Z" }"#,
        )
        .unwrap();
        let data = FileProximityData::new(&path);
        assert!(data.is_registered());
        assert!(data.has_new_data_since(Some(t0() - Duration::hours(1))));
        assert!(!data.has_new_data_since(Some(t0())));
    }

    #[test]
    fn test_checkin_store_records_and_prunes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonCheckinStore::new(dir.path().join("checkins.json"));
        for days in [1, 5, 20] {
            store
                .record(VenueCheckin {
                    payload: format!("v{}", days),
                    timestamp: t0() - Duration::days(days),
                })
                .expect("record");
        }
        assert_eq!(store.checkins().len(), 3);

        let removed = store.prune_before(t0() - Duration::days(14));
        assert_eq!(removed, 1);
        let payloads: Vec<String> = store.checkins().into_iter().map(|c| c.payload).collect();
        assert_eq!(payloads, vec!["v1".to_string(), "v5".to_string()]);
    }
}
