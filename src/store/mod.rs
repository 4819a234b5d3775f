//! Durable storage for the relative step offset.
//!
//! The counter restarts from zero whenever the process does. The last
//! reported value is saved here and handed back as the next session's offset.

pub mod file;

use crate::sensor::types::StepSample;
use std::sync::Mutex;

pub use file::{FileOffsetStore, PersistedOffset, OFFSET_NAMESPACE};

/// Key/value persistence for the step offset.
///
/// Writers are expected to be serialized by the caller.
pub trait OffsetStore: Send {
    /// The persisted offset, or `(0, 0)` if nothing was saved yet.
    fn load(&self) -> Result<StepSample, StoreError>;

    /// Replace the persisted offset.
    fn save(&self, offset: StepSample) -> Result<(), StoreError>;
}

/// Errors from an [`OffsetStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),
}

/// In-process store, handy for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    value: Mutex<Option<StepSample>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(offset: StepSample) -> Self {
        Self {
            value: Mutex::new(Some(offset)),
        }
    }
}

impl OffsetStore for MemoryOffsetStore {
    fn load(&self) -> Result<StepSample, StoreError> {
        Ok(self
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_default())
    }

    fn save(&self, offset: StepSample) -> Result<(), StoreError> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(offset);
        Ok(())
    }
}
