pub mod engine;
pub mod keys;
pub mod types;

pub use engine::{CachedQuery, SyncEngine};
pub use keys::{canonical_json, QueryKey};
pub use types::{
    AggregateBuilder, AggregateSpec, CategorySpec, EntityFetcher, RemoteEntity, SyncErrorEvent,
    SyncEvent, SyncPass, SyncState, SyncStatus, TombstoneEvent, VersionEntry, VersionFeed,
    VersionSnapshot,
};
