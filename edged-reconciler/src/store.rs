//! State store contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::resource::{ResourceKind, StateSnapshot};

/// Durable persistence for exactly one snapshot per resource kind.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved snapshot for `kind`, or None if none exists.
    async fn load(&self, kind: ResourceKind) -> Result<Option<StateSnapshot>, StoreError>;

    /// Overwrite the snapshot for `kind`.
    async fn save(&self, kind: ResourceKind, snapshot: &StateSnapshot) -> Result<(), StoreError>;
}

/// In-process store holding one serialized blob per kind.
///
/// Goes through JSON like the durable stores do, so corrupt-payload
/// handling is exercised the same way in tests.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<&'static str, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, kind: ResourceKind) -> Result<Option<StateSnapshot>, StoreError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|e| StoreError::Load(e.to_string()))?;

        match blobs.get(kind.as_str()) {
            Some(payload) => {
                let snapshot = serde_json::from_str(payload)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, kind: ResourceKind, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(snapshot).map_err(|e| StoreError::Save(e.to_string()))?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        blobs.insert(kind.as_str(), payload);
        Ok(())
    }
}
