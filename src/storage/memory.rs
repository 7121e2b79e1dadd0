//! MemoryBackend: a StorageBackend that holds everything in process memory.
//!
//! Serves as the volatile session tier and as the backend for tests. Data
//! lives exactly as long as the value (or its `Arc`).

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::traits::{Scope, StorageBackend, StorageResult};

/// Interior mutability via `parking_lot::Mutex` so the backend is
/// `Send + Sync` and shareable behind `Arc<dyn StorageBackend>`.
#[derive(Default)]
pub struct MemoryBackend {
    /// scope → (key → value); BTreeMap keeps `keys()` sorted for free.
    tables: Mutex<HashMap<Scope, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes stored across every scope (keys excluded).
    pub fn stored_bytes(&self) -> usize {
        self.tables
            .lock()
            .values()
            .flat_map(|t| t.values())
            .map(|v| v.len())
            .sum()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, scope: &Scope, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .lock()
            .get(scope)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn put(&self, scope: &Scope, key: &str, value: &[u8]) -> StorageResult<()> {
        self.tables
            .lock()
            .entry(scope.clone())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, scope: &Scope, key: &str) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get_mut(scope) {
            table.remove(key);
            if table.is_empty() {
                tables.remove(scope);
            }
        }
        Ok(())
    }

    fn keys(&self, scope: &Scope) -> StorageResult<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .get(scope)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn clear(&self, scope: &Scope) -> StorageResult<()> {
        self.tables.lock().remove(scope);
        Ok(())
    }

    fn scan(&self, scope: &Scope) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .tables
            .lock()
            .get(scope)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}
