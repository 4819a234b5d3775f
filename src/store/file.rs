//! JSON file backed offset store.

use crate::sensor::types::StepSample;
use crate::store::{OffsetStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Name of the persisted record inside the data directory.
pub const OFFSET_NAMESPACE: &str = "step_offset";

/// On-disk format of the offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedOffset {
    pub offset_timestamp: i64,
    pub offset_steps: i32,
    pub last_updated: DateTime<Utc>,
}

impl PersistedOffset {
    pub fn sample(&self) -> StepSample {
        StepSample::new(self.offset_timestamp, self.offset_steps)
    }
}

/// Stores the offset as `<dir>/step_offset.json`.
///
/// Writes go to a temporary file that is renamed over the old one, so a
/// crash mid-write never leaves a truncated record behind. A record that
/// cannot be parsed is moved to `step_offset.json.bad` on load, so the next
/// save does not destroy it.
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
    path: PathBuf,
}

impl FileOffsetStore {
    /// Store inside `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir
                .as_ref()
                .join(format!("{OFFSET_NAMESPACE}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an unparseable record is moved.
    pub fn unreadable_path(&self) -> PathBuf {
        self.path.with_extension("json.bad")
    }

    /// Full persisted record, including when it was written.
    pub fn load_record(&self) -> Result<Option<PersistedOffset>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let record: PersistedOffset =
            serde_json::from_str(&content).map_err(|e| StoreError::Parse(e.to_string()))?;
        Ok(Some(record))
    }
}

impl OffsetStore for FileOffsetStore {
    fn load(&self) -> Result<StepSample, StoreError> {
        match self.load_record() {
            Ok(record) => Ok(record.map(|record| record.sample()).unwrap_or_default()),
            Err(e @ StoreError::Parse(_)) => {
                let bad = self.unreadable_path();
                match std::fs::rename(&self.path, &bad) {
                    Ok(()) => warn!(path = ?bad, "Moved unreadable step offset aside"),
                    Err(rename_err) => warn!(
                        error = %rename_err,
                        "Could not move unreadable step offset aside"
                    ),
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn save(&self, offset: StepSample) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let record = PersistedOffset {
            offset_timestamp: offset.timestamp,
            offset_steps: offset.steps,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("step-offset-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_missing_file_loads_zero() {
        let store = FileOffsetStore::in_dir(scratch_dir());
        assert_eq!(store.load().unwrap(), StepSample::ZERO);
        assert!(store.load_record().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = scratch_dir();
        let store = FileOffsetStore::in_dir(&dir);

        store.save(StepSample::new(9_000_000_000, 1_234)).unwrap();
        store.save(StepSample::new(50, 3)).unwrap();
        assert_eq!(store.load().unwrap(), StepSample::new(50, 3));
        assert!(!store.path().with_extension("json.tmp").exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let store = FileOffsetStore::in_dir(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(store.load(), Err(StoreError::Parse(_))));
        assert!(!store.path().exists());
        assert_eq!(
            std::fs::read_to_string(store.unreadable_path()).unwrap(),
            "{ not json"
        );

        // the next save starts a fresh record and keeps the old one aside
        store.save(StepSample::new(10, 1)).unwrap();
        assert_eq!(store.load().unwrap(), StepSample::new(10, 1));
        assert!(store.unreadable_path().exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
