pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use traits::{Scope, StorageBackend, StorageResult, Table};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, StorageError};

/// `Meta` entry holding the sync engine's list of cached keys.
pub const KNOWN_KEYS: &str = "known-keys";

/// Read and deserialize a JSON value stored under `key`.
pub fn read_json<T: DeserializeOwned>(
    backend: &dyn StorageBackend,
    scope: &Scope,
    key: &str,
) -> Result<Option<T>> {
    match backend.get(scope, key)? {
        Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            StorageError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }
            .into()
        }),
        None => Ok(None),
    }
}

/// Serialize `value` as JSON and store it under `key`.
pub fn write_json<T: Serialize>(
    backend: &dyn StorageBackend,
    scope: &Scope,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    backend.put(scope, key, &bytes)?;
    Ok(())
}
