//! Process-wide registry of named snapshots.

use super::SnapshotData;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Snapshots by key, shared by every module in the process.
///
/// Entries live until deleted or until the registry is dropped; nothing is
/// persisted.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    snapshots: RwLock<HashMap<String, Arc<SnapshotData>>>,
}

impl SnapshotRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `data` under `key`, replacing any previous snapshot.
    pub fn register(&self, key: &str, data: SnapshotData) -> Arc<SnapshotData> {
        let data = Arc::new(data);
        let prev = self
            .snapshots
            .write()
            .unwrap()
            .insert(key.to_string(), data.clone());
        if prev.is_some() {
            log::debug!("replaced snapshot {key}");
        } else {
            log::debug!("registered snapshot {key} ({:#x} bytes)", data.size());
        }
        data
    }

    /// Whether a snapshot is registered under `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.snapshots.read().unwrap().contains_key(key)
    }

    /// The snapshot registered under `key`.
    pub fn get(&self, key: &str) -> Result<Arc<SnapshotData>> {
        self.snapshots
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound(key.to_string()))
    }

    /// Removes the snapshot under `key`, returning whether there was one.
    ///
    /// Modules that already hold the snapshot keep it alive until they drop
    /// it.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.snapshots.write().unwrap().remove(key).is_some();
        if removed {
            log::debug!("deleted snapshot {key}");
        }
        removed
    }

    /// Number of registered snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.read().unwrap().len()
    }

    /// Whether no snapshots are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every snapshot.
    pub fn clear(&self) {
        self.snapshots.write().unwrap().clear();
    }
}
