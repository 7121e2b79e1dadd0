//! EncryptedStore: per-identity encrypted key→value cache.
//!
//! Values are encoded with the binary-safe codec, sealed with the identity's
//! data key (AAD binds identity and cache key) and persisted as
//! [`CacheRecord`]s in the `Cache` table. An in-memory LRU index bounds the
//! total ciphertext size.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use less_crypto::{open, seal, DataKey, EncryptionContext};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use super::codec::{self, Payload};
use super::record::CacheRecord;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::storage::{Scope, StorageBackend, Table};

/// A decrypted cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub data: T,
    pub version: i64,
    pub cached_at: i64,
}

// ============================================================================
// LRU index
// ============================================================================

struct IndexEntry {
    size: u64,
    tick: u64,
}

/// Record sizes plus access order. Lower tick = less recently used.
#[derive(Default)]
struct LruIndex {
    entries: HashMap<String, IndexEntry>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    total: u64,
}

impl LruIndex {
    /// Seed from persisted records, oldest `cached_at` first.
    fn from_records(records: &mut [CacheRecord]) -> Self {
        records.sort_by(|a, b| a.cached_at.cmp(&b.cached_at).then_with(|| a.key.cmp(&b.key)));
        let mut index = Self::default();
        for record in records.iter() {
            index.insert(&record.key, record.size());
        }
        index
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn insert(&mut self, key: &str, size: u64) {
        self.remove(key);
        let tick = self.bump();
        self.order.insert(tick, key.to_string());
        self.entries.insert(key.to_string(), IndexEntry { size, tick });
        self.total += size;
    }

    fn touch(&mut self, key: &str) {
        let tick = self.bump();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<u64> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.total -= entry.size;
        Some(entry.size)
    }

    fn least_recent_except(&self, keep: &str) -> Option<String> {
        self.order.values().find(|k| k.as_str() != keep).cloned()
    }
}

struct OpenState {
    data_key: DataKey,
    index: LruIndex,
}

// ============================================================================
// EncryptedStore
// ============================================================================

pub struct EncryptedStore {
    backend: Arc<dyn StorageBackend>,
    scope: Scope,
    budget: u64,
    state: Mutex<Option<OpenState>>,
}

impl EncryptedStore {
    pub fn new(backend: Arc<dyn StorageBackend>, identity: impl Into<String>, config: &CacheConfig) -> Self {
        Self::with_budget(backend, identity, config.max_store_bytes)
    }

    /// Store with an explicit ciphertext budget in bytes.
    pub fn with_budget(backend: Arc<dyn StorageBackend>, identity: impl Into<String>, budget: u64) -> Self {
        Self {
            backend,
            scope: Scope::new(identity, Table::Cache),
            budget,
            state: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.scope.identity
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Bind the store to `data_key` and load the LRU index.
    ///
    /// Records that cannot be parsed are dropped from the backend. Reopening
    /// an open store rebinds the key and rebuilds the index.
    pub fn open(&self, data_key: DataKey) -> Result<()> {
        let mut records = Vec::new();
        for (key, bytes) in self.backend.scan(&self.scope)? {
            match serde_json::from_slice::<CacheRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "dropping unreadable cache record");
                    self.backend.delete(&self.scope, &key)?;
                }
            }
        }

        let index = LruIndex::from_records(&mut records);
        tracing::debug!(
            identity = %self.scope.identity,
            records = index.entries.len(),
            bytes = index.total,
            "encrypted store opened"
        );
        *self.state.lock() = Some(OpenState { data_key, index });
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Drop the data key and index. Persisted records are kept.
    pub fn close(&self) {
        if self.state.lock().take().is_some() {
            tracing::debug!(identity = %self.scope.identity, "encrypted store closed");
        }
    }

    fn context(&self, key: &str) -> EncryptionContext {
        EncryptionContext::new(self.scope.identity.clone(), key)
    }

    /// Decrypt and decode the value under `key`.
    ///
    /// Any failure (closed store, missing record, bad ciphertext, bad
    /// encoding) is a miss. A hit marks the key most recently used.
    pub fn get_value(&self, key: &str) -> Option<Cached<Payload>> {
        let mut guard = self.state.lock();
        let state = guard.as_mut()?;

        let bytes = match self.backend.get(&self.scope, key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed");
                return None;
            }
        };

        let decoded = serde_json::from_slice::<CacheRecord>(&bytes)
            .map_err(CacheError::from)
            .and_then(|record| {
                let plaintext = open(
                    state.data_key.as_bytes(),
                    &record.ciphertext,
                    &record.iv,
                    Some(&self.context(key)),
                )?;
                Ok((record, codec::from_bytes(&plaintext)?))
            });

        match decoded {
            Ok((record, data)) => {
                state.index.touch(key);
                Some(Cached {
                    data,
                    version: record.version,
                    cached_at: record.cached_at,
                })
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "cache record could not be decrypted; treating as miss");
                None
            }
        }
    }

    /// Typed read. A value that does not deserialize into `T` is a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
        let cached = self.get_value(key)?;
        match serde_json::from_value(cached.data.into_json()) {
            Ok(data) => Some(Cached {
                data,
                version: cached.version,
                cached_at: cached.cached_at,
            }),
            Err(e) => {
                tracing::warn!(key, error = %e, "cached value has unexpected shape; treating as miss");
                None
            }
        }
    }

    /// Encrypt and persist `value` under `key`, then evict down to budget.
    pub fn put_value(&self, key: &str, value: &Payload, version: i64) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(CacheError::StoreClosed)?;

        let plaintext = codec::to_bytes(value)?;
        let sealed = seal(state.data_key.as_bytes(), &plaintext, Some(&self.context(key)))?;
        let record = CacheRecord {
            key: key.to_string(),
            ciphertext: sealed.ciphertext,
            iv: sealed.iv.to_vec(),
            version,
            cached_at: crate::now_ms(),
        };

        let size = record.size();
        if size > self.budget {
            return Err(CacheError::RecordTooLarge {
                key: key.to_string(),
                size,
                budget: self.budget,
            });
        }

        self.backend
            .put(&self.scope, key, &serde_json::to_vec(&record)?)?;
        state.index.insert(key, size);

        while state.index.total > self.budget {
            let Some(victim) = state.index.least_recent_except(key) else {
                break;
            };
            state.index.remove(&victim);
            self.backend.delete(&self.scope, &victim)?;
            tracing::debug!(key = %victim, "evicted least recently used cache record");
        }
        Ok(())
    }

    /// Typed write through the codec.
    pub fn put<T: Serialize>(&self, key: &str, value: &T, version: i64) -> Result<()> {
        let payload = Payload::from(serde_json::to_value(value)?);
        self.put_value(key, &payload, version)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(CacheError::StoreClosed)?;
        self.backend.delete(&self.scope, key)?;
        state.index.remove(key);
        Ok(())
    }

    /// Remove every record for this identity.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(CacheError::StoreClosed)?;
        self.backend.clear(&self.scope)?;
        state.index = LruIndex::default();
        tracing::debug!(identity = %self.scope.identity, "encrypted store cleared");
        Ok(())
    }

    /// Keys currently held, sorted. Empty when closed.
    pub fn keys(&self) -> Vec<String> {
        let guard = self.state.lock();
        let mut keys: Vec<String> = guard
            .as_ref()
            .map(|s| s.index.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Sum of record sizes. Zero when closed.
    pub fn total_size(&self) -> u64 {
        self.state.lock().as_ref().map_or(0, |s| s.index.total)
    }

    pub fn len(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.index.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
