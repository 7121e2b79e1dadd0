//! SyncEngine: keeps the flattened query cache in step with the server's
//! version feed.
//!
//! Per category: diff server `modified_at` against cached versions, fetch
//! only what differs in one batch, tombstone what the server no longer
//! lists, then rebuild the category's aggregate views.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::keys::QueryKey;
use super::types::{
    CategorySpec, EntityFetcher, SyncErrorEvent, SyncEvent, SyncPass, SyncState, SyncStatus,
    TombstoneEvent, VersionEntry, VersionFeed, VersionSnapshot,
};
use crate::error::{CacheError, RemoteErrorKind, Result};
use crate::events::{Listeners, Subscription};
use crate::storage::{read_json, write_json, Scope, StorageBackend, Table, KNOWN_KEYS};
use crate::store::EncryptedStore;

/// A cached query result held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub data: Value,
    pub version: i64,
}

/// Entry of the persisted known-keys list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KnownEntry {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<String>,
    #[serde(default)]
    aggregate: bool,
}

impl KnownEntry {
    fn ad_hoc(key: String) -> Self {
        Self {
            key,
            category: None,
            entity_id: None,
            aggregate: false,
        }
    }

    fn entity(key: String, category: &str, id: &str) -> Self {
        Self {
            key,
            category: Some(category.to_string()),
            entity_id: Some(id.to_string()),
            aggregate: false,
        }
    }

    fn aggregate(key: String, category: &str) -> Self {
        Self {
            key,
            category: Some(category.to_string()),
            entity_id: None,
            aggregate: true,
        }
    }
}

#[derive(Default)]
struct EngineState {
    sync: SyncState,
    queries: HashMap<String, CachedQuery>,
    known: BTreeMap<String, KnownEntry>,
}

pub struct SyncEngine {
    store: Arc<EncryptedStore>,
    backend: Arc<dyn StorageBackend>,
    meta: Scope,
    fetcher: Arc<dyn EntityFetcher>,
    categories: Vec<CategorySpec>,
    state: Mutex<EngineState>,
    listeners: Listeners<SyncEvent>,
}

impl SyncEngine {
    /// `backend` is the durable tier holding the known-keys list; it is
    /// normally the same backend `store` writes to.
    pub fn new(
        store: Arc<EncryptedStore>,
        backend: Arc<dyn StorageBackend>,
        fetcher: Arc<dyn EntityFetcher>,
        categories: Vec<CategorySpec>,
    ) -> Self {
        Self {
            meta: Scope::new(store.identity(), Table::Meta),
            store,
            backend,
            fetcher,
            categories,
            state: Mutex::new(EngineState::default()),
            listeners: Listeners::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.lock().sync
    }

    pub fn subscribe(&self, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    pub fn categories(&self) -> &[CategorySpec] {
        &self.categories
    }

    /// Cache keys currently tracked, sorted.
    pub fn known_keys(&self) -> Vec<String> {
        self.state.lock().known.keys().cloned().collect()
    }

    fn update_state(&self, f: impl FnOnce(&mut SyncState)) {
        let snapshot = {
            let mut state = self.state.lock();
            f(&mut state.sync);
            state.sync
        };
        self.listeners.notify(&SyncEvent::Status(snapshot));
    }

    fn publish(&self, events: Vec<SyncEvent>) {
        for event in &events {
            self.listeners.notify(event);
        }
    }

    // ------------------------------------------------------------------
    // Session start
    // ------------------------------------------------------------------

    /// Load the known-keys list and every record it names into memory.
    ///
    /// Keys whose record is gone (evicted, undecryptable) are dropped from
    /// the list.
    pub fn load(&self) -> Result<()> {
        self.update_state(|s| s.status = SyncStatus::Loading);
        let result = self.load_records();
        self.update_state(|s| {
            s.status = SyncStatus::Idle;
            if result.is_err() {
                s.error = true;
            }
        });
        result
    }

    fn load_records(&self) -> Result<()> {
        let known: Vec<KnownEntry> = read_json(&*self.backend, &self.meta, KNOWN_KEYS)?.unwrap_or_default();
        let listed = known.len();

        let mut queries = HashMap::new();
        let mut retained = BTreeMap::new();
        for entry in known {
            if let Some(cached) = self.store.get::<Value>(&entry.key) {
                queries.insert(
                    entry.key.clone(),
                    CachedQuery {
                        data: cached.data,
                        version: cached.version,
                    },
                );
                retained.insert(entry.key.clone(), entry);
            }
        }
        let loaded = retained.len();
        {
            let mut state = self.state.lock();
            state.queries = queries;
            state.known = retained;
        }
        if loaded != listed {
            self.persist_known()?;
        }
        tracing::debug!(identity = %self.meta.identity, loaded, dropped = listed - loaded, "sync cache loaded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Memory first, then the encrypted store (result kept in memory).
    fn lookup(&self, key: &str) -> Option<CachedQuery> {
        if let Some(hit) = self.state.lock().queries.get(key) {
            return Some(hit.clone());
        }
        let cached = self.store.get::<Value>(key)?;
        let query = CachedQuery {
            data: cached.data,
            version: cached.version,
        };
        self.state
            .lock()
            .queries
            .insert(key.to_string(), query.clone());
        Some(query)
    }

    pub fn get_query(&self, key: &QueryKey) -> Option<Value> {
        self.lookup(&key.cache_key()).map(|q| q.data)
    }

    pub fn get_cached(&self, key: &QueryKey) -> Option<CachedQuery> {
        self.lookup(&key.cache_key())
    }

    /// Cached data of one entity of a configured category.
    pub fn get_entity(&self, category: &str, id: &str) -> Option<Value> {
        let spec = self.categories.iter().find(|c| c.name == category)?;
        self.get_query(&QueryKey::entity(&spec.resource, id))
    }

    /// Cache an ad-hoc query result with the current time as its version.
    pub fn set_query(&self, key: &QueryKey, data: Value) -> Result<()> {
        let cache_key = key.cache_key();
        let version = crate::now_ms();
        self.store.put(&cache_key, &data, version)?;
        {
            let mut state = self.state.lock();
            state
                .queries
                .insert(cache_key.clone(), CachedQuery { data, version });
            state
                .known
                .entry(cache_key.clone())
                .or_insert_with(|| KnownEntry::ad_hoc(cache_key.clone()));
        }
        self.persist_known()?;
        self.listeners
            .notify(&SyncEvent::QueryUpdated { key: cache_key });
        Ok(())
    }

    /// Drop the in-memory copies; the next access reloads from the store.
    pub fn refresh(&self) {
        self.state.lock().queries.clear();
        tracing::debug!(identity = %self.meta.identity, "sync cache memory cleared");
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Reconcile every configured category present in `snapshot`.
    ///
    /// Fetch failures are collected in the returned pass and set the error
    /// flag; storage failures abort the pass.
    pub async fn reconcile(&self, snapshot: &VersionSnapshot) -> Result<SyncPass> {
        self.update_state(|s| s.status = SyncStatus::Syncing);

        let mut pass = SyncPass::default();
        let result = self.reconcile_all(snapshot, &mut pass).await;

        let failed = result.is_err() || !pass.is_clean();
        self.update_state(|s| {
            s.status = SyncStatus::Idle;
            s.error = failed;
            if result.is_ok() {
                s.last_synced_at = Some(crate::now_ms());
            }
        });

        tracing::debug!(
            identity = %self.meta.identity,
            fetched = pass.fetched,
            tombstoned = pass.tombstoned.len(),
            errors = pass.errors.len(),
            "reconcile finished"
        );
        result.map(|()| pass)
    }

    async fn reconcile_all(&self, snapshot: &VersionSnapshot, pass: &mut SyncPass) -> Result<()> {
        for name in snapshot.categories.keys() {
            if !self.categories.iter().any(|c| &c.name == name) {
                tracing::debug!(category = %name, "ignoring untracked category");
            }
        }
        for category in &self.categories {
            if let Some(entries) = snapshot.categories.get(&category.name) {
                let category_pass = self.reconcile_category(category, entries).await?;
                pass.merge(category_pass);
            }
        }
        self.persist_known()
    }

    async fn reconcile_category(&self, category: &CategorySpec, entries: &[VersionEntry]) -> Result<SyncPass> {
        let mut pass = SyncPass::default();
        let mut events = Vec::new();
        let mut changed = false;

        // 1. Server id set.
        let server: BTreeMap<&str, i64> = entries
            .iter()
            .map(|e| (e.entity_id.as_str(), e.modified_at))
            .collect();

        // 2. Diff against cached versions.
        let mut stale = Vec::new();
        for (&id, &modified_at) in &server {
            let key = QueryKey::entity(&category.resource, id).cache_key();
            match self.lookup(&key) {
                Some(cached) if cached.version == modified_at => {
                    self.state
                        .lock()
                        .known
                        .entry(key.clone())
                        .or_insert_with(|| KnownEntry::entity(key, &category.name, id));
                }
                _ => stale.push(id.to_string()),
            }
        }

        // 3-4. One batch fetch for everything stale.
        if !stale.is_empty() {
            match self.fetcher.fetch_by_ids(&category.name, &stale).await {
                Ok(entities) => {
                    for entity in entities {
                        let Some(&version) = server.get(entity.id.as_str()) else {
                            tracing::debug!(category = %category.name, id = %entity.id, "ignoring entity outside the version set");
                            continue;
                        };
                        let key = QueryKey::entity(&category.resource, &entity.id).cache_key();
                        match self.store.put(&key, &entity.data, version) {
                            Ok(()) => {}
                            Err(CacheError::RecordTooLarge { size, budget, .. }) => {
                                tracing::warn!(category = %category.name, id = %entity.id, size, budget, "entity too large to cache");
                                pass.errors.push(SyncErrorEvent {
                                    category: Some(category.name.clone()),
                                    ids: vec![entity.id],
                                    error: format!("entity of {size} bytes exceeds store budget of {budget} bytes"),
                                    kind: RemoteErrorKind::Permanent,
                                });
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                        {
                            let mut state = self.state.lock();
                            state.queries.insert(
                                key.clone(),
                                CachedQuery {
                                    data: entity.data,
                                    version,
                                },
                            );
                            state
                                .known
                                .insert(key.clone(), KnownEntry::entity(key.clone(), &category.name, &entity.id));
                        }
                        events.push(SyncEvent::QueryUpdated { key });
                        pass.fetched += 1;
                        changed = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(category = %category.name, count = stale.len(), error = %e, "batch fetch failed; keeping stale data");
                    pass.errors.push(SyncErrorEvent {
                        category: Some(category.name.clone()),
                        ids: stale,
                        error: e.message,
                        kind: e.kind,
                    });
                }
            }
        }

        // 5. Tombstones.
        let cached_entities: Vec<(String, String)> = {
            let state = self.state.lock();
            state
                .known
                .values()
                .filter(|e| !e.aggregate && e.category.as_deref() == Some(category.name.as_str()))
                .filter_map(|e| e.entity_id.clone().map(|id| (e.key.clone(), id)))
                .collect()
        };
        for (key, id) in cached_entities {
            if server.contains_key(id.as_str()) {
                continue;
            }
            let previous_data = self.lookup(&key).map(|q| q.data);
            self.store.delete(&key)?;
            {
                let mut state = self.state.lock();
                state.queries.remove(&key);
                state.known.remove(&key);
            }
            events.push(SyncEvent::QueryRemoved { key });
            pass.tombstoned.push(TombstoneEvent {
                category: category.name.clone(),
                id,
                previous_data,
            });
            changed = true;
        }

        // 6. Aggregate views.
        if !category.aggregates.is_empty() && (changed || self.aggregates_missing(category)) {
            let mut members = Vec::new();
            let mut version = 0i64;
            for &id in server.keys() {
                if let Some(cached) = self.lookup(&QueryKey::entity(&category.resource, id).cache_key()) {
                    version = version.max(cached.version);
                    members.push(cached.data);
                }
            }
            for aggregate in &category.aggregates {
                let data = (aggregate.build)(&members);
                let key = QueryKey::view(&aggregate.resource).cache_key();
                self.store.put(&key, &data, version)?;
                {
                    let mut state = self.state.lock();
                    state
                        .queries
                        .insert(key.clone(), CachedQuery { data, version });
                    state
                        .known
                        .insert(key.clone(), KnownEntry::aggregate(key.clone(), &category.name));
                }
                events.push(SyncEvent::QueryUpdated { key });
                pass.aggregates_rebuilt += 1;
            }
        }

        tracing::debug!(
            category = %category.name,
            server = server.len(),
            fetched = pass.fetched,
            tombstoned = pass.tombstoned.len(),
            "category reconciled"
        );
        self.publish(events);
        Ok(pass)
    }

    fn aggregates_missing(&self, category: &CategorySpec) -> bool {
        let state = self.state.lock();
        category
            .aggregates
            .iter()
            .any(|a| !state.known.contains_key(&QueryKey::view(&a.resource).cache_key()))
    }

    /// Reconcile each snapshot from `feed` until it ends.
    ///
    /// Feed errors are collected like fetch failures and do not stop the
    /// loop.
    pub async fn follow<F: VersionFeed + ?Sized>(&self, feed: &mut F) -> Result<SyncPass> {
        let mut total = SyncPass::default();
        while let Some(item) = feed.next().await {
            match item {
                Ok(snapshot) => total.merge(self.reconcile(&snapshot).await?),
                Err(e) => {
                    tracing::warn!(error = %e, "version feed error");
                    self.update_state(|s| s.error = true);
                    total.errors.push(SyncErrorEvent {
                        category: None,
                        ids: Vec::new(),
                        error: e.message,
                        kind: e.kind,
                    });
                }
            }
        }
        Ok(total)
    }

    fn persist_known(&self) -> Result<()> {
        let entries: Vec<KnownEntry> = self.state.lock().known.values().cloned().collect();
        write_json(&*self.backend, &self.meta, KNOWN_KEYS, &entries)
    }

    /// Ids of every cached entity of `category`, sorted.
    pub fn cached_entity_ids(&self, category: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .known
            .values()
            .filter(|e| !e.aggregate && e.category.as_deref() == Some(category))
            .filter_map(|e| e.entity_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
