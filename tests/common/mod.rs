//! Scripted fakes for the remote collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use less_cache::{
    EntityFetcher, IssuedKek, KeyIssuer, MutationError, MutationExecutor, RemoteEntity, RemoteError,
    RemoteErrorKind, VersionEntry, VersionSnapshot,
};
use less_crypto::MasterKey;
use serde_json::{json, Value};

// ============================================================================
// Key issuer
// ============================================================================

/// First-writer-wins key server.
#[derive(Default)]
pub struct FakeIssuer {
    current: Mutex<Option<(Vec<u8>, u32)>>,
    offline: AtomicBool,
    failure: Mutex<Option<RemoteErrorKind>>,
    needs_rotation: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeIssuer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject every issuer call with an error of `kind` until cleared.
    pub fn set_failure(&self, kind: Option<RemoteErrorKind>) {
        *self.failure.lock().unwrap() = kind;
    }

    pub fn set_needs_rotation(&self, needs: bool) {
        self.needs_rotation.store(needs, Ordering::SeqCst);
    }

    /// Simulate a rotation performed by another device.
    pub fn rotate_elsewhere(&self) -> u32 {
        let mut current = self.current.lock().unwrap();
        let version = current.as_ref().map_or(1, |(_, v)| v + 1);
        *current = Some((MasterKey::generate().unwrap().export(), version));
        version
    }

    pub fn version(&self) -> Option<u32> {
        self.current.lock().unwrap().as_ref().map(|(_, v)| *v)
    }
}

#[async_trait]
impl KeyIssuer for FakeIssuer {
    async fn get_or_create_kek(&self, seed: Option<Vec<u8>>) -> Result<IssuedKek, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::offline());
        }
        if let Some(kind) = *self.failure.lock().unwrap() {
            return Err(RemoteError::with_kind("issuer refused", kind));
        }
        let mut current = self.current.lock().unwrap();
        if current.is_none() {
            let seed = seed.ok_or_else(|| RemoteError::new("no key and no seed"))?;
            *current = Some((seed, 1));
        }
        let (kek, kek_version) = current.clone().unwrap();
        Ok(IssuedKek {
            kek,
            kek_version,
            needs_rotation: self.needs_rotation.load(Ordering::SeqCst),
        })
    }

    async fn rotate_kek(&self, new_kek: Vec<u8>) -> Result<u32, RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::offline());
        }
        let mut current = self.current.lock().unwrap();
        let version = current.as_ref().map_or(1, |(_, v)| v + 1);
        *current = Some((new_kek, version));
        self.needs_rotation.store(false, Ordering::SeqCst);
        Ok(version)
    }
}

// ============================================================================
// Mutation executor
// ============================================================================

#[derive(Default)]
pub struct ScriptedExecutor {
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn call_args(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|(_, a)| a.clone()).collect()
    }
}

#[async_trait]
impl MutationExecutor for ScriptedExecutor {
    async fn execute(&self, name: &str, args: Value) -> Result<Value, MutationError> {
        self.calls.lock().unwrap().push((name.to_string(), args));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(MutationError::Failed("network unreachable".to_string()));
        }
        if self.failing.lock().unwrap().contains(name) {
            return Err(MutationError::Failed(format!("{name} rejected")));
        }
        Ok(json!({ "ok": true }))
    }
}

// ============================================================================
// Entity fetcher
// ============================================================================

#[derive(Default)]
pub struct FakeFetcher {
    entities: Mutex<HashMap<(String, String), Value>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    failing: AtomicBool,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, category: &str, id: &str, data: Value) {
        self.entities
            .lock()
            .unwrap()
            .insert((category.to_string(), id.to_string()), data);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl EntityFetcher for FakeFetcher {
    async fn fetch_by_ids(&self, category: &str, ids: &[String]) -> Result<Vec<RemoteEntity>, RemoteError> {
        self.calls
            .lock()
            .unwrap()
            .push((category.to_string(), ids.to_vec()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::new("server unavailable"));
        }
        let entities = self.entities.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                entities
                    .get(&(category.to_string(), id.clone()))
                    .map(|data| RemoteEntity::new(id.clone(), data.clone()))
            })
            .collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn entries(items: &[(&str, i64)]) -> Vec<VersionEntry> {
    items
        .iter()
        .map(|(id, modified_at)| VersionEntry::new(*id, *modified_at))
        .collect()
}

pub fn snapshot(category: &str, items: &[(&str, i64)]) -> VersionSnapshot {
    VersionSnapshot::new().with_category(category, entries(items))
}
