//! Encrypted offline cache: a per-identity encrypted key→value store, a
//! durable mutation outbox and a version-feed sync engine, wired together by
//! [`OfflineCache`].

pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod keys;
pub mod outbox;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::CacheConfig;
pub use error::{CacheError, MutationError, RemoteError, RemoteErrorKind, Result, StorageError};
pub use events::{Listeners, Subscription};
pub use facade::{Backends, CacheStatus, OfflineCache, Queued, Session};
pub use keys::{IssuedKek, Invalidation, KeyBootstrap, KeyIssuer, KeyManager, KeyRotation};
pub use outbox::{
    FallbackQueue, MutationExecutor, MutationOutbox, MutationRecord, MutationRegistry, MutationStatus,
    OutboxEvent, OutboxStats, ProcessResult,
};
pub use storage::{MemoryBackend, Scope, StorageBackend, Table};
#[cfg(feature = "sqlite")]
pub use storage::SqliteBackend;
pub use store::{Cached, EncryptedStore, Payload, TypedArray};
pub use sync::{
    AggregateSpec, CategorySpec, EntityFetcher, QueryKey, RemoteEntity, SyncEngine, SyncEvent, SyncPass,
    SyncState, SyncStatus, VersionEntry, VersionFeed, VersionSnapshot,
};

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
