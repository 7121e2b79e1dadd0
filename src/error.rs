//! Error types for the cache, outbox, sync and key-management layers.

use std::time::Duration;

use less_crypto::CryptoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Failures of the persistent key-value backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(String),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt record {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// Why a single mutation execution did not succeed.
///
/// Recorded on the mutation record and retried on the next drain; never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("{0}")]
    Failed(String),

    #[error("Mutation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("No handler registered for mutation \"{0}\"")]
    Unknown(String),

    #[error("Invalid arguments for mutation \"{name}\": {message}")]
    InvalidArgs { name: String, message: String },
}

/// Classification of remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Retriable (network, temporary failures)
    Transient,
    /// Not retriable (validation, unknown entity, etc.)
    Permanent,
    /// Authentication failed
    Auth,
    /// No connectivity at all
    Offline,
}

/// Error reported by a remote collaborator (key issuer, fetcher, feed).
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: RemoteErrorKind::Transient,
        }
    }

    pub fn offline() -> Self {
        Self {
            message: "offline".to_string(),
            kind: RemoteErrorKind::Offline,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: RemoteErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("No master key available offline for identity {identity}")]
    OfflineBootstrapUnavailable { identity: String },

    #[error("Wrapped data key has version {local}, master key is at version {remote}")]
    KeyVersionMismatch { local: u32, remote: u32 },

    #[error("Encrypted store is not open")]
    StoreClosed,

    #[error("No identity is signed in")]
    NotSignedIn,

    #[error("Record {key} is {size} bytes, larger than the whole store budget of {budget} bytes")]
    RecordTooLarge { key: String, size: u64, budget: u64 },

    #[error("Mutation executor has not been set")]
    ExecutorNotSet,

    #[error("Invalid mutation name \"{0}\": expected namespace.action")]
    InvalidMutationName(String),

    #[error("Mutation \"{0}\" is already registered")]
    DuplicateMutation(String),

    #[error("Fallback queue is full ({capacity} entries); the mutation was not stored and may be lost")]
    FallbackQueueFull { capacity: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),
}
