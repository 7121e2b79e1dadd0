//! Bounded queue for mutations issued before an identity's outbox can be
//! opened (no signed-in identity, or key bootstrap unavailable).
//!
//! Entries are stored unencrypted in a separate tier under a fixed scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::queue::MutationOutbox;
use crate::error::{CacheError, Result};
use crate::storage::{write_json, Scope, StorageBackend, Table};

/// Identity under which fallback entries are kept.
pub const FALLBACK_IDENTITY: &str = "_fallback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackEntry {
    pub id: String,
    pub mutation_name: String,
    pub args: Value,
    pub created_at: i64,
    pub seq: u64,
}

pub struct FallbackQueue {
    backend: Arc<dyn StorageBackend>,
    scope: Scope,
    capacity: usize,
    next_seq: AtomicU64,
}

impl FallbackQueue {
    pub fn open(backend: Arc<dyn StorageBackend>, capacity: usize) -> Result<Self> {
        let queue = Self {
            backend,
            scope: Scope::new(FALLBACK_IDENTITY, Table::Fallback),
            capacity,
            next_seq: AtomicU64::new(0),
        };
        let next = queue.entries()?.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        queue.next_seq.store(next, Ordering::SeqCst);
        Ok(queue)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a mutation.
    ///
    /// Fails with [`CacheError::FallbackQueueFull`] at capacity; the caller
    /// must treat the mutation as possibly lost.
    pub fn push(&self, mutation_name: &str, args: Value) -> Result<String> {
        if self.len()? >= self.capacity {
            tracing::warn!(capacity = self.capacity, mutation = mutation_name, "fallback queue full; dropping mutation");
            return Err(CacheError::FallbackQueueFull {
                capacity: self.capacity,
            });
        }
        let entry = FallbackEntry {
            id: uuid::Uuid::new_v4().to_string(),
            mutation_name: mutation_name.to_string(),
            args,
            created_at: crate::now_ms(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        write_json(&*self.backend, &self.scope, &entry.id, &entry)?;
        Ok(entry.id)
    }

    /// Queued entries, oldest first.
    pub fn entries(&self) -> Result<Vec<FallbackEntry>> {
        let mut entries = Vec::new();
        for (key, bytes) in self.backend.scan(&self.scope)? {
            match serde_json::from_slice::<FallbackEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable fallback entry"),
            }
        }
        entries.sort_by_key(|e| (e.created_at, e.seq));
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.backend.keys(&self.scope)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Move every entry into `outbox` in order, then clear the queue.
    ///
    /// Each entry is deleted as soon as it is in the outbox, so a failure
    /// part way leaves the rest queued here without duplicating any.
    pub fn drain_into(&self, outbox: &MutationOutbox) -> Result<usize> {
        let entries = self.entries()?;
        let moved = entries.len();
        for entry in entries {
            outbox.enqueue_at(&entry.mutation_name, entry.args, entry.created_at)?;
            self.backend.delete(&self.scope, &entry.id)?;
        }
        self.backend.clear(&self.scope)?;
        if moved > 0 {
            tracing::info!(identity = outbox.identity(), moved, "migrated fallback queue into outbox");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    #[test]
    fn push_until_full() {
        let queue = FallbackQueue::open(Arc::new(MemoryBackend::new()), 2).unwrap();
        queue.push("m.a", json!(1)).unwrap();
        queue.push("m.b", json!(2)).unwrap();
        let err = queue.push("m.c", json!(3)).unwrap_err();
        assert!(matches!(err, CacheError::FallbackQueueFull { capacity: 2 }));
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn drain_moves_entries_in_order() {
        let fallback_tier = Arc::new(MemoryBackend::new());
        let queue = FallbackQueue::open(fallback_tier, 10).unwrap();
        for name in ["m.a", "m.b", "m.c"] {
            queue.push(name, json!({"n": name})).unwrap();
        }

        let outbox =
            MutationOutbox::open(Arc::new(MemoryBackend::new()), "u1", &CacheConfig::default()).unwrap();
        assert_eq!(queue.drain_into(&outbox).unwrap(), 3);
        assert!(queue.is_empty().unwrap());

        let names: Vec<String> = outbox
            .get_pending()
            .unwrap()
            .into_iter()
            .map(|r| r.mutation_name)
            .collect();
        assert_eq!(names, vec!["m.a", "m.b", "m.c"]);
    }

    #[test]
    fn survives_reopen() {
        let tier = Arc::new(MemoryBackend::new());
        let first = FallbackQueue::open(tier.clone(), 10).unwrap();
        first.push("m.a", json!({})).unwrap();
        drop(first);

        let again = FallbackQueue::open(tier, 10).unwrap();
        again.push("m.b", json!({})).unwrap();
        let names: Vec<String> = again.entries().unwrap().into_iter().map(|e| e.mutation_name).collect();
        assert_eq!(names, vec!["m.a", "m.b"]);
    }
}
