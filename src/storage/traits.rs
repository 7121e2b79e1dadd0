//! Persistent key-value backend contract.

use crate::error::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Logical tables inside one identity's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Wrapped data key.
    Keys,
    /// Encrypted cache records keyed by composite cache key.
    Cache,
    /// Mutation records keyed by mutation id.
    Outbox,
    /// Bookkeeping (known cache keys, outbox sequence).
    Meta,
    /// Session-scoped master key copy. Only written to the volatile tier.
    Session,
    /// Pre-sign-in mutation queue. Only written to the fallback tier.
    Fallback,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Keys => "keys",
            Table::Cache => "cache",
            Table::Outbox => "outbox",
            Table::Meta => "meta",
            Table::Session => "session",
            Table::Fallback => "fallback",
        }
    }
}

/// One table within one identity's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub identity: String,
    pub table: Table,
}

impl Scope {
    pub fn new(identity: impl Into<String>, table: Table) -> Self {
        Self {
            identity: identity.into(),
            table,
        }
    }
}

/// Durable (or volatile, for the session tier) key-value storage.
///
/// # Threading
/// All methods are synchronous. The SQLite implementation blocks the
/// calling thread for the duration of the statement.
pub trait StorageBackend: Send + Sync {
    fn get(&self, scope: &Scope, key: &str) -> StorageResult<Option<Vec<u8>>>;
    fn put(&self, scope: &Scope, key: &str, value: &[u8]) -> StorageResult<()>;
    fn delete(&self, scope: &Scope, key: &str) -> StorageResult<()>;
    /// All keys in the scope, sorted ascending.
    fn keys(&self, scope: &Scope) -> StorageResult<Vec<String>>;
    /// Remove every key in the scope.
    fn clear(&self, scope: &Scope) -> StorageResult<()>;

    /// All entries in the scope, sorted by key.
    fn scan(&self, scope: &Scope) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for key in self.keys(scope)? {
            if let Some(value) = self.get(scope, &key)? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}
