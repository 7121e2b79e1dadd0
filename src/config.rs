//! Runtime configuration supplied by the embedding application.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Default store budget: 500 MB of ciphertext.
pub const DEFAULT_MAX_STORE_BYTES: u64 = 500 * 1024 * 1024;

/// Default per-mutation execution timeout.
pub const DEFAULT_MUTATION_TIMEOUT_MS: u64 = 10_000;

/// Default number of entries the pre-sign-in fallback queue may hold.
pub const DEFAULT_FALLBACK_CAPACITY: usize = 100;

/// Configuration for `OfflineCache` and the components it builds.
///
/// Parsed from camelCase JSON; every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Ciphertext budget per identity store (default: 500 MB)
    pub max_store_bytes: u64,
    /// Per-mutation execution timeout in milliseconds (default: 10 000)
    pub mutation_timeout_ms: u64,
    /// Fallback queue capacity (default: 100)
    pub fallback_capacity: usize,
    /// SQLite file for the durable tier; `None` = caller supplies a backend
    pub database_path: Option<PathBuf>,
    /// SQLite file for the pre-sign-in fallback queue (default: next to
    /// `database_path` with a `.fallback.sqlite3` extension)
    pub fallback_database_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: DEFAULT_MAX_STORE_BYTES,
            mutation_timeout_ms: DEFAULT_MUTATION_TIMEOUT_MS,
            fallback_capacity: DEFAULT_FALLBACK_CAPACITY,
            database_path: None,
            fallback_database_path: None,
        }
    }
}

impl CacheConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CacheConfig =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_store_bytes == 0 {
            return Err(CacheError::Config(
                "maxStoreBytes must be greater than zero".to_string(),
            ));
        }
        if self.mutation_timeout_ms == 0 {
            return Err(CacheError::Config(
                "mutationTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if self.fallback_capacity == 0 {
            return Err(CacheError::Config(
                "fallbackCapacity must be greater than zero".to_string(),
            ));
        }
        if let (Some(durable), Some(fallback)) = (&self.database_path, self.fallback_path()) {
            if durable == &fallback {
                return Err(CacheError::Config(
                    "fallbackDatabasePath must differ from databasePath".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// File backing the fallback tier, derived from `database_path` unless
    /// set explicitly.
    pub fn fallback_path(&self) -> Option<PathBuf> {
        self.fallback_database_path.clone().or_else(|| {
            self.database_path
                .as_deref()
                .map(|path| path.with_extension("fallback.sqlite3"))
        })
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_store_bytes, 524_288_000);
        assert_eq!(config.mutation_timeout(), Duration::from_secs(10));
        assert_eq!(config.fallback_capacity, 100);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CacheConfig::from_json(r#"{"mutationTimeoutMs": 2500}"#).unwrap();
        assert_eq!(config.mutation_timeout_ms, 2500);
        assert_eq!(config.max_store_bytes, DEFAULT_MAX_STORE_BYTES);
    }

    #[test]
    fn database_path_is_parsed() {
        let config = CacheConfig::from_json(r#"{"databasePath": "/tmp/cache.sqlite3"}"#).unwrap();
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/tmp/cache.sqlite3"))
        );
    }

    #[test]
    fn fallback_path_defaults_next_to_database() {
        let config = CacheConfig::from_json(r#"{"databasePath": "/tmp/cache.sqlite3"}"#).unwrap();
        assert_eq!(
            config.fallback_path().as_deref(),
            Some(Path::new("/tmp/cache.fallback.sqlite3"))
        );
        assert_eq!(CacheConfig::default().fallback_path(), None);
    }

    #[test]
    fn explicit_fallback_path_wins() {
        let config = CacheConfig::from_json(
            r#"{"databasePath": "/tmp/a.db", "fallbackDatabasePath": "/tmp/queue.db"}"#,
        )
        .unwrap();
        assert_eq!(config.fallback_path().as_deref(), Some(Path::new("/tmp/queue.db")));
    }

    #[test]
    fn rejects_shared_fallback_file() {
        let err = CacheConfig::from_json(
            r#"{"databasePath": "/tmp/a.db", "fallbackDatabasePath": "/tmp/a.db"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fallbackDatabasePath"));
    }

    #[test]
    fn rejects_zero_budget() {
        let err = CacheConfig::from_json(r#"{"maxStoreBytes": 0}"#).unwrap_err();
        assert!(err.to_string().contains("maxStoreBytes"));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            CacheConfig::from_json("{not json"),
            Err(CacheError::Config(_))
        ));
    }
}
