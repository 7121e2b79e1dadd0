//! KeyManager: bootstrap and rotation of the two-tier key hierarchy.
//!
//! The master key (KEK) lives on the server and, for the length of a
//! session, in the volatile session tier. The data key (DEK) is persisted
//! only wrapped under the KEK, tagged with the KEK version it was wrapped at.

use std::sync::Arc;

use less_crypto::{unwrap_data_key, wrap_data_key, DataKey, MasterKey, WrappedKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::remote::KeyIssuer;
use crate::error::{CacheError, RemoteErrorKind, Result};
use crate::storage::{read_json, write_json, Scope, StorageBackend, Table, KNOWN_KEYS};

const WRAPPED_KEY_ENTRY: &str = "data-key";
const SESSION_KEK_ENTRY: &str = "master-key";

/// Why bootstrap discarded the local wrapped key and cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// The master key was rotated elsewhere.
    VersionMismatch { local: u32, remote: u32 },
    /// Same version, but the wrapped key did not unwrap (corrupt record or a
    /// lost first-writer race).
    UnwrapFailed,
}

/// Outcome of [`KeyManager::bootstrap`].
#[derive(Debug)]
pub struct KeyBootstrap {
    pub data_key: DataKey,
    pub master_key_version: u32,
    pub needs_rotation: bool,
    /// Set when the local store was wiped and a fresh data key installed.
    pub invalidation: Option<Invalidation>,
}

impl KeyBootstrap {
    pub fn invalidated(&self) -> bool {
        self.invalidation.is_some()
    }
}

/// Outcome of [`KeyManager::rotate`].
#[derive(Debug)]
pub struct KeyRotation {
    pub master_key_version: u32,
    pub data_key: DataKey,
}

/// Session-tier copy of the master key.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionKek {
    #[serde(with = "less_crypto::base64url::serde_bytes_b64")]
    kek: Vec<u8>,
    version: u32,
    #[serde(default)]
    needs_rotation: bool,
}

impl Drop for SessionKek {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.kek);
    }
}

/// Fails with [`CacheError::KeyVersionMismatch`] unless `wrapped` was made
/// under master key version `current`.
pub fn verify_key_version(wrapped: &WrappedKey, current: u32) -> Result<()> {
    if wrapped.wrapped_by_kek_version != current {
        return Err(CacheError::KeyVersionMismatch {
            local: wrapped.wrapped_by_kek_version,
            remote: current,
        });
    }
    Ok(())
}

pub struct KeyManager {
    durable: Arc<dyn StorageBackend>,
    session: Arc<dyn StorageBackend>,
    issuer: Arc<dyn KeyIssuer>,
}

impl KeyManager {
    pub fn new(
        durable: Arc<dyn StorageBackend>,
        session: Arc<dyn StorageBackend>,
        issuer: Arc<dyn KeyIssuer>,
    ) -> Self {
        Self {
            durable,
            session,
            issuer,
        }
    }

    /// Produce the active data key for `identity`.
    ///
    /// Falls back to the session copy of the master key when the issuer is
    /// unreachable. A wrapped key made under another master key version, or
    /// one that no longer unwraps, wipes the identity's cache and is
    /// replaced.
    pub async fn bootstrap(&self, identity: &str) -> Result<KeyBootstrap> {
        let local = self.load_wrapped(identity)?;

        let seed = Zeroizing::new(MasterKey::generate()?.export());
        let (master_key, version, needs_rotation) =
            match self.issuer.get_or_create_kek(Some(seed.to_vec())).await {
                Ok(issued) => {
                    let kek = Zeroizing::new(issued.kek.clone());
                    (MasterKey::import(&kek)?, issued.kek_version, issued.needs_rotation)
                }
                Err(e) if matches!(e.kind, RemoteErrorKind::Offline | RemoteErrorKind::Transient) => {
                    tracing::warn!(identity, error = %e, "key issuer unreachable; trying session master key");
                    match self.load_session_kek(identity)? {
                        Some(cached) => (MasterKey::import(&cached.kek)?, cached.version, cached.needs_rotation),
                        None => {
                            return Err(CacheError::OfflineBootstrapUnavailable {
                                identity: identity.to_string(),
                            })
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(identity, error = %e, kind = ?e.kind, "key issuer refused bootstrap");
                    return Err(e.into());
                }
            };

        self.store_session_kek(identity, &master_key, version, needs_rotation)?;

        let (data_key, invalidation) = match local {
            None => (self.install_data_key(identity, &master_key, version)?, None),
            Some(wrapped) if wrapped.wrapped_by_kek_version != version => {
                tracing::info!(
                    identity,
                    local = wrapped.wrapped_by_kek_version,
                    remote = version,
                    "master key rotated elsewhere; invalidating local cache"
                );
                let cause = Invalidation::VersionMismatch {
                    local: wrapped.wrapped_by_kek_version,
                    remote: version,
                };
                self.invalidate(identity)?;
                (self.install_data_key(identity, &master_key, version)?, Some(cause))
            }
            Some(wrapped) => match unwrap_data_key(&wrapped, &master_key) {
                Ok(data_key) => (data_key, None),
                Err(e) => {
                    tracing::warn!(identity, version, error = %e, "wrapped data key failed to unwrap; invalidating local cache");
                    self.invalidate(identity)?;
                    (
                        self.install_data_key(identity, &master_key, version)?,
                        Some(Invalidation::UnwrapFailed),
                    )
                }
            },
        };

        tracing::debug!(identity, version, invalidation = ?invalidation, "keys bootstrapped");
        Ok(KeyBootstrap {
            data_key,
            master_key_version: version,
            needs_rotation,
            invalidation,
        })
    }

    /// Rotate the master key and replace the data key.
    ///
    /// Existing cache records become unreadable and are discarded.
    pub async fn rotate(&self, identity: &str) -> Result<KeyRotation> {
        let master_key = MasterKey::generate()?;
        let version = self
            .issuer
            .rotate_kek(Zeroizing::new(master_key.export()).to_vec())
            .await?;

        self.store_session_kek(identity, &master_key, version, false)?;
        self.invalidate(identity)?;
        let data_key = self.install_data_key(identity, &master_key, version)?;

        tracing::info!(identity, version, "master key rotated");
        Ok(KeyRotation {
            master_key_version: version,
            data_key,
        })
    }

    /// The persisted wrapped data key, if any.
    pub fn load_wrapped(&self, identity: &str) -> Result<Option<WrappedKey>> {
        read_json(&*self.durable, &Scope::new(identity, Table::Keys), WRAPPED_KEY_ENTRY)
    }

    /// Drop the session copy of the master key.
    pub fn forget_session(&self, identity: &str) -> Result<()> {
        self.session
            .delete(&Scope::new(identity, Table::Session), SESSION_KEK_ENTRY)?;
        Ok(())
    }

    fn install_data_key(&self, identity: &str, master_key: &MasterKey, version: u32) -> Result<DataKey> {
        let data_key = DataKey::generate()?;
        let wrapped = wrap_data_key(&data_key, master_key, version)?;
        write_json(
            &*self.durable,
            &Scope::new(identity, Table::Keys),
            WRAPPED_KEY_ENTRY,
            &wrapped,
        )?;
        Ok(data_key)
    }

    fn invalidate(&self, identity: &str) -> Result<()> {
        self.durable.clear(&Scope::new(identity, Table::Cache))?;
        self.durable
            .delete(&Scope::new(identity, Table::Meta), KNOWN_KEYS)?;
        Ok(())
    }

    fn load_session_kek(&self, identity: &str) -> Result<Option<SessionKek>> {
        read_json(&*self.session, &Scope::new(identity, Table::Session), SESSION_KEK_ENTRY)
    }

    fn store_session_kek(
        &self,
        identity: &str,
        master_key: &MasterKey,
        version: u32,
        needs_rotation: bool,
    ) -> Result<()> {
        let entry = SessionKek {
            kek: master_key.export(),
            version,
            needs_rotation,
        };
        let bytes = Zeroizing::new(serde_json::to_vec(&entry)?);
        self.session
            .put(&Scope::new(identity, Table::Session), SESSION_KEK_ENTRY, &bytes)?;
        Ok(())
    }
}
