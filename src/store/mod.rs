//! Durable storage of the status engine's state.
//!
//! The orchestrator writes the whole [`PersistedStatus`] at the end of each
//! refresh cycle, so a failed write is repaired by the next successful one.

pub mod json;
mod migrations;
pub mod sqlite;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::types::PersistedStatus;

pub use json::JsonFileStore;
pub use sqlite::SqliteStore;

pub trait StatusStore: Send + Sync {
    /// Load the last saved status; `None` on first run.
    fn load(&self) -> Result<Option<PersistedStatus>, StoreError>;

    fn save(&self, status: &PersistedStatus) -> Result<(), StoreError>;
}

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    status: Mutex<Option<PersistedStatus>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: PersistedStatus) -> Self {
        Self {
            status: Mutex::new(Some(status)),
        }
    }
}

impl StatusStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedStatus>, StoreError> {
        Ok(self.status.lock().clone())
    }

    fn save(&self, status: &PersistedStatus) -> Result<(), StoreError> {
        *self.status.lock() = Some(status.clone());
        Ok(())
    }
}
