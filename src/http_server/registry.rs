//! In-memory extension block registry.
//!
//! Bounded map from `(type, version)` to the validated manifest. Writes
//! land here only after the schema validator has accepted the manifest.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

pub const REGISTRY_CAPACITY: usize = 64;

#[derive(Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    CapacityReached,
}

#[derive(Default)]
pub struct BlockRegistry {
    entries: Mutex<HashMap<(String, String), Value>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        BlockRegistry::default()
    }

    pub fn upsert(
        &self,
        block_type: &str,
        version: &str,
        manifest: Value,
    ) -> Result<UpsertOutcome, RegistryError> {
        let mut entries = self.entries.lock().unwrap();
        let key = (block_type.to_string(), version.to_string());
        if entries.contains_key(&key) {
            entries.insert(key, manifest);
            return Ok(UpsertOutcome::Updated);
        }
        if entries.len() >= REGISTRY_CAPACITY {
            return Err(RegistryError::CapacityReached);
        }
        entries.insert(key, manifest);
        Ok(UpsertOutcome::Created)
    }

    pub fn remove(&self, block_type: &str, version: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .remove(&(block_type.to_string(), version.to_string()))
            .is_some()
    }

    pub fn get(&self, block_type: &str, version: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap()
            .get(&(block_type.to_string(), version.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
