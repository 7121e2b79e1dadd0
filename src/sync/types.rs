//! Sync-specific types: remote collaborator traits and the data structures
//! exchanged during reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{RemoteError, RemoteErrorKind};

// ============================================================================
// Remote collaborators (user-provided network layer)
// ============================================================================

/// Batch fetch of full entities by id.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    /// Fetch the current data of `ids` in `category` in one round trip.
    /// Ids the server no longer knows may simply be absent from the result.
    async fn fetch_by_ids(
        &self,
        category: &str,
        ids: &[String],
    ) -> std::result::Result<Vec<RemoteEntity>, RemoteError>;
}

/// Stream of "what changed" snapshots.
///
/// `None` ends the stream. An `Err` item is reported and skipped.
#[async_trait]
pub trait VersionFeed: Send {
    async fn next(&mut self) -> Option<std::result::Result<VersionSnapshot, RemoteError>>;
}

#[async_trait]
impl VersionFeed for mpsc::Receiver<VersionSnapshot> {
    async fn next(&mut self) -> Option<std::result::Result<VersionSnapshot, RemoteError>> {
        self.recv().await.map(Ok)
    }
}

#[async_trait]
impl VersionFeed for mpsc::Receiver<std::result::Result<VersionSnapshot, RemoteError>> {
    async fn next(&mut self) -> Option<std::result::Result<VersionSnapshot, RemoteError>> {
        self.recv().await
    }
}

// ============================================================================
// Version feed data
// ============================================================================

/// Server modification time of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub entity_id: String,
    pub modified_at: i64,
}

impl VersionEntry {
    pub fn new(entity_id: impl Into<String>, modified_at: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            modified_at,
        }
    }
}

/// Full version sets for some categories. Categories not present are left
/// untouched by reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub categories: BTreeMap<String, Vec<VersionEntry>>,
}

impl VersionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: impl Into<String>, entries: Vec<VersionEntry>) -> Self {
        self.categories.insert(category.into(), entries);
        self
    }
}

/// One entity returned by [`EntityFetcher::fetch_by_ids`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub id: String,
    pub data: Value,
}

impl RemoteEntity {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self { id: id.into(), data }
    }
}

// ============================================================================
// Category configuration
// ============================================================================

pub type AggregateBuilder = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A view derived from all entities of a category (e.g. "all tags").
#[derive(Clone)]
pub struct AggregateSpec {
    pub resource: String,
    /// Receives the category's entities ordered by entity id.
    pub build: AggregateBuilder,
}

impl AggregateSpec {
    pub fn new(resource: impl Into<String>, build: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
        Self {
            resource: resource.into(),
            build: Arc::new(build),
        }
    }
}

impl std::fmt::Debug for AggregateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateSpec")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

/// A tracked category of server entities.
#[derive(Debug, Clone)]
pub struct CategorySpec {
    /// Name used in version snapshots and fetch calls.
    pub name: String,
    /// Resource under which single entities are cached.
    pub resource: String,
    pub aggregates: Vec<AggregateSpec>,
}

impl CategorySpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            resource: name.clone(),
            name,
            aggregates: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateSpec) -> Self {
        self.aggregates.push(aggregate);
        self
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Uninitialized,
    Loading,
    Idle,
    Syncing,
}

/// Engine status plus the sticky error flag. The flag never blocks reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub error: bool,
    pub last_synced_at: Option<i64>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Uninitialized,
            error: false,
            last_synced_at: None,
        }
    }
}

/// Change notification published to engine subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Status(SyncState),
    QueryUpdated { key: String },
    QueryRemoved { key: String },
}

// ============================================================================
// Sync Result Types
// ============================================================================

/// A sync error event. Collected in `SyncPass.errors`, never thrown.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncErrorEvent {
    /// Category being reconciled; `None` for feed-level failures.
    pub category: Option<String>,
    pub ids: Vec<String>,
    pub error: String,
    pub kind: RemoteErrorKind,
}

/// Fired when a cached entity disappears from the server's version set.
#[derive(Debug, Clone, PartialEq)]
pub struct TombstoneEvent {
    pub category: String,
    pub id: String,
    pub previous_data: Option<Value>,
}

/// Aggregated result of one or more reconcile passes.
#[derive(Debug, Clone, Default)]
pub struct SyncPass {
    pub fetched: usize,
    pub tombstoned: Vec<TombstoneEvent>,
    pub aggregates_rebuilt: usize,
    pub errors: Vec<SyncErrorEvent>,
}

impl SyncPass {
    pub fn merge(&mut self, other: SyncPass) {
        self.fetched += other.fetched;
        self.tombstoned.extend(other.tombstoned);
        self.aggregates_rebuilt += other.aggregates_rebuilt;
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
