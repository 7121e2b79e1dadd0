//! OfflineCache: wires keys, store, outbox and sync engine together for
//! the signed-in identity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::keys::{KeyBootstrap, KeyIssuer, KeyManager};
use crate::outbox::{validate_mutation_name, FallbackQueue, MutationExecutor, MutationOutbox, ProcessResult};
use crate::storage::{MemoryBackend, StorageBackend};
use crate::store::EncryptedStore;
use crate::sync::{CategorySpec, EntityFetcher, SyncEngine, SyncState};

/// The three storage tiers.
#[derive(Clone)]
pub struct Backends {
    /// Wrapped keys, cache records, outbox, bookkeeping.
    pub durable: Arc<dyn StorageBackend>,
    /// Volatile copy of the master key for offline reloads.
    pub session: Arc<dyn StorageBackend>,
    /// Pre-sign-in mutation queue.
    pub fallback: Arc<dyn StorageBackend>,
}

impl Backends {
    /// Everything in process memory.
    pub fn in_memory() -> Self {
        Self {
            durable: Arc::new(MemoryBackend::new()),
            session: Arc::new(MemoryBackend::new()),
            fallback: Arc::new(MemoryBackend::new()),
        }
    }

    /// SQLite at `config.database_path` for the durable tier and a second
    /// file at `config.fallback_path()` for the fallback tier, memory for the
    /// session tier.
    #[cfg(feature = "sqlite")]
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        use crate::storage::SqliteBackend;

        let (Some(durable), Some(fallback)) = (config.database_path.as_ref(), config.fallback_path()) else {
            return Err(CacheError::Config("databasePath is required for the SQLite tier".to_string()));
        };
        Ok(Self {
            durable: Arc::new(SqliteBackend::open(durable)?),
            session: Arc::new(MemoryBackend::new()),
            fallback: Arc::new(SqliteBackend::open(&fallback)?),
        })
    }
}

/// Where a mutation issued through [`OfflineCache::mutate`] went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Queued {
    Outbox(String),
    Fallback(String),
}

/// Snapshot returned by [`OfflineCache::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub identity: Option<String>,
    /// An identity is signed in and its store is open.
    pub enabled: bool,
    pub online: bool,
    pub pending: usize,
    pub failed: usize,
    pub fallback_queued: usize,
    pub needs_rotation: bool,
    pub master_key_version: Option<u32>,
    pub sync: Option<SyncState>,
}

/// Components opened for one identity.
pub struct Session {
    pub identity: String,
    pub master_key_version: u32,
    pub store: Arc<EncryptedStore>,
    pub outbox: Arc<MutationOutbox>,
    pub sync: Arc<SyncEngine>,
}

/// Sign-in parameters kept while key bootstrap is unavailable offline.
struct PendingSignIn {
    identity: String,
    fetcher: Arc<dyn EntityFetcher>,
    categories: Vec<CategorySpec>,
}

enum SessionState {
    SignedOut,
    Disabled(PendingSignIn),
    Active(Arc<Session>),
}

pub struct OfflineCache {
    config: CacheConfig,
    backends: Backends,
    keys: KeyManager,
    fallback: FallbackQueue,
    executor: Mutex<Option<Arc<dyn MutationExecutor>>>,
    state: Mutex<SessionState>,
    online: AtomicBool,
    needs_rotation: AtomicBool,
}

impl OfflineCache {
    /// Validate `config`, check the crypto backend and open the fallback
    /// queue. Starts signed out and online.
    pub fn new(config: CacheConfig, backends: Backends, issuer: Arc<dyn KeyIssuer>) -> Result<Self> {
        config.validate()?;
        less_crypto::ensure_available()?;

        let keys = KeyManager::new(
            Arc::clone(&backends.durable),
            Arc::clone(&backends.session),
            issuer,
        );
        let fallback = FallbackQueue::open(Arc::clone(&backends.fallback), config.fallback_capacity)?;
        Ok(Self {
            config,
            backends,
            keys,
            fallback,
            executor: Mutex::new(None),
            state: Mutex::new(SessionState::SignedOut),
            online: AtomicBool::new(true),
            needs_rotation: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Install the executor used to drain outboxes (current and future).
    pub fn set_executor(&self, executor: Arc<dyn MutationExecutor>) {
        if let Some(session) = self.session() {
            session.outbox.set_executor(Arc::clone(&executor));
        }
        *self.executor.lock() = Some(executor);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The active session, if an identity is signed in with keys available.
    pub fn session(&self) -> Option<Arc<Session>> {
        match &*self.state.lock() {
            SessionState::Active(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub fn fallback(&self) -> &FallbackQueue {
        &self.fallback
    }

    /// Bootstrap keys for `identity` and open its store, outbox and sync
    /// engine. Fallback-queued mutations move into the outbox.
    ///
    /// Without connectivity and without a session master key this fails
    /// with [`CacheError::OfflineBootstrapUnavailable`]; the cache stays
    /// disabled and the sign-in is retried by `set_online(true)`.
    pub async fn sign_in(
        &self,
        identity: &str,
        fetcher: Arc<dyn EntityFetcher>,
        categories: Vec<CategorySpec>,
    ) -> Result<Arc<Session>> {
        if let Some(previous) = self.session() {
            if previous.identity != identity {
                tracing::info!(from = %previous.identity, to = identity, "identity changed");
            }
            previous.store.close();
            *self.state.lock() = SessionState::SignedOut;
        }

        match self.keys.bootstrap(identity).await {
            Ok(boot) => self.activate(identity, boot, fetcher, categories).await,
            Err(e @ CacheError::OfflineBootstrapUnavailable { .. }) => {
                tracing::warn!(identity, "no master key available offline; cache disabled until reconnect");
                *self.state.lock() = SessionState::Disabled(PendingSignIn {
                    identity: identity.to_string(),
                    fetcher,
                    categories,
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn activate(
        &self,
        identity: &str,
        boot: KeyBootstrap,
        fetcher: Arc<dyn EntityFetcher>,
        categories: Vec<CategorySpec>,
    ) -> Result<Arc<Session>> {
        let KeyBootstrap {
            data_key,
            master_key_version,
            needs_rotation,
            invalidation,
        } = boot;

        let store = Arc::new(EncryptedStore::new(
            Arc::clone(&self.backends.durable),
            identity,
            &self.config,
        ));
        store.open(data_key)?;

        let outbox = Arc::new(MutationOutbox::open(
            Arc::clone(&self.backends.durable),
            identity,
            &self.config,
        )?);
        let executor = self.executor.lock().clone();
        if let Some(executor) = executor {
            outbox.set_executor(executor);
        }

        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&self.backends.durable),
            fetcher,
            categories,
        ));
        sync.load()?;

        let migrated = self.fallback.drain_into(&outbox)?;
        self.needs_rotation.store(needs_rotation, Ordering::SeqCst);

        let session = Arc::new(Session {
            identity: identity.to_string(),
            master_key_version,
            store,
            outbox,
            sync,
        });
        *self.state.lock() = SessionState::Active(Arc::clone(&session));
        tracing::info!(identity, master_key_version, invalidation = ?invalidation, migrated, "offline cache enabled");

        self.drain_if_online(&session).await?;
        Ok(session)
    }

    /// Wipe the identity's cache, forget its session master key and close
    /// everything. Queued mutations stay in the durable outbox.
    pub fn sign_out(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::SignedOut);
        let identity = match previous {
            SessionState::Active(session) => {
                session.store.clear()?;
                session.store.close();
                session.sync.refresh();
                session.identity.clone()
            }
            SessionState::Disabled(pending) => pending.identity,
            SessionState::SignedOut => return Ok(()),
        };
        self.keys.forget_session(&identity)?;
        self.needs_rotation.store(false, Ordering::SeqCst);
        tracing::info!(identity = %identity, "signed out");
        Ok(())
    }

    /// Rotate the master key of the signed-in identity. The cache restarts
    /// empty under the new data key.
    pub async fn rotate_keys(&self) -> Result<u32> {
        let session = self.session().ok_or(CacheError::NotSignedIn)?;
        let rotation = self.keys.rotate(&session.identity).await?;
        session.store.open(rotation.data_key)?;
        session.sync.refresh();
        session.sync.load()?;

        let rotated = Arc::new(Session {
            identity: session.identity.clone(),
            master_key_version: rotation.master_key_version,
            store: Arc::clone(&session.store),
            outbox: Arc::clone(&session.outbox),
            sync: Arc::clone(&session.sync),
        });
        *self.state.lock() = SessionState::Active(rotated);
        self.needs_rotation.store(false, Ordering::SeqCst);
        Ok(rotation.master_key_version)
    }

    /// Record a connectivity change.
    ///
    /// Going online retries a disabled sign-in and drains the outbox.
    pub async fn set_online(&self, online: bool) -> Result<Option<ProcessResult>> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online != was_online {
            tracing::info!(online, "connectivity changed");
        }
        if !online {
            return Ok(None);
        }

        let pending = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SessionState::SignedOut) {
                SessionState::Disabled(pending) => Some(pending),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(pending) = pending {
            self.sign_in(&pending.identity, pending.fetcher, pending.categories)
                .await?;
            // sign_in already drained.
            return Ok(None);
        }

        match self.session() {
            Some(session) => self.drain_if_online(&session).await,
            None => Ok(None),
        }
    }

    async fn drain_if_online(&self, session: &Session) -> Result<Option<ProcessResult>> {
        if !self.is_online() || self.executor.lock().is_none() {
            return Ok(None);
        }
        session.outbox.process().await.map(Some)
    }

    /// Queue a mutation: into the outbox when a session is active (drained
    /// right away when online), otherwise into the fallback queue.
    pub async fn mutate(&self, name: &str, args: Value) -> Result<Queued> {
        validate_mutation_name(name)?;
        match self.session() {
            Some(session) => {
                let id = session.outbox.enqueue(name, args)?;
                self.drain_if_online(&session).await?;
                Ok(Queued::Outbox(id))
            }
            None => Ok(Queued::Fallback(self.fallback.push(name, args)?)),
        }
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let (identity, session) = match &*self.state.lock() {
            SessionState::Active(session) => (Some(session.identity.clone()), Some(Arc::clone(session))),
            SessionState::Disabled(pending) => (Some(pending.identity.clone()), None),
            SessionState::SignedOut => (None, None),
        };
        let stats = match &session {
            Some(session) => session.outbox.get_stats()?,
            None => Default::default(),
        };
        Ok(CacheStatus {
            identity,
            enabled: session.is_some(),
            online: self.is_online(),
            pending: stats.pending + stats.processing,
            failed: stats.failed,
            fallback_queued: self.fallback.len()?,
            needs_rotation: self.needs_rotation.load(Ordering::SeqCst),
            master_key_version: session.as_ref().map(|s| s.master_key_version),
            sync: session.as_ref().map(|s| s.sync.state()),
        })
    }
}
