//! MutationOutbox: durable, ordered queue of writes awaiting execution.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use super::registry::MutationExecutor;
use super::types::{MutationRecord, MutationStatus, OutboxEvent, OutboxStats, ProcessResult};
use crate::config::CacheConfig;
use crate::error::{CacheError, MutationError, Result};
use crate::events::{Listeners, Subscription};
use crate::storage::{read_json, write_json, Scope, StorageBackend, Table};

const SEQ_ENTRY: &str = "outbox-seq";

/// Clears the in-progress flag when the drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MutationOutbox {
    backend: Arc<dyn StorageBackend>,
    scope: Scope,
    meta: Scope,
    timeout: Duration,
    executor: Mutex<Option<Arc<dyn MutationExecutor>>>,
    /// Serializes status checks against the write that claims or deletes a
    /// record. Never held across an await.
    claim: Mutex<()>,
    draining: AtomicBool,
    next_seq: AtomicU64,
    listeners: Listeners<OutboxEvent>,
}

impl MutationOutbox {
    /// Open the outbox for `identity`.
    ///
    /// Records left `processing` by an interrupted drain are reset to
    /// `pending`.
    pub fn open(backend: Arc<dyn StorageBackend>, identity: impl Into<String>, config: &CacheConfig) -> Result<Self> {
        let identity = identity.into();
        let outbox = Self {
            scope: Scope::new(identity.clone(), Table::Outbox),
            meta: Scope::new(identity, Table::Meta),
            backend,
            timeout: config.mutation_timeout(),
            executor: Mutex::new(None),
            claim: Mutex::new(()),
            draining: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            listeners: Listeners::new(),
        };

        let records = outbox.load_all()?;
        let stored_seq: u64 = read_json(&*outbox.backend, &outbox.meta, SEQ_ENTRY)?.unwrap_or(0);
        let max_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        outbox.next_seq.store(stored_seq.max(max_seq), Ordering::SeqCst);

        outbox.reset_interrupted()?;
        Ok(outbox)
    }

    /// Return `processing` records to `pending`. Only valid while no drain
    /// is executing: at open, or with the drain guard held.
    fn reset_interrupted(&self) -> Result<usize> {
        let _claim = self.claim.lock();
        let mut recovered = 0;
        for mut record in self.load_all()? {
            if record.status == MutationStatus::Processing {
                record.status = MutationStatus::Pending;
                self.save(&record)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(identity = %self.scope.identity, recovered, "reset interrupted mutations to pending");
        }
        Ok(recovered)
    }

    pub fn identity(&self) -> &str {
        &self.scope.identity
    }

    pub fn set_executor(&self, executor: Arc<dyn MutationExecutor>) {
        *self.executor.lock() = Some(executor);
    }

    pub fn subscribe(&self, listener: impl Fn(&OutboxEvent) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Whether a drain currently holds the single-flight guard.
    pub fn is_processing(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Append a `pending` mutation. Returns its id.
    pub fn enqueue(&self, mutation_name: &str, args: Value) -> Result<String> {
        self.enqueue_at(mutation_name, args, crate::now_ms())
    }

    /// Append with an explicit creation time (fallback migration keeps the
    /// first creation time so ordering is preserved).
    pub(crate) fn enqueue_at(&self, mutation_name: &str, args: Value, created_at: i64) -> Result<String> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        write_json(&*self.backend, &self.meta, SEQ_ENTRY, &(seq + 1))?;

        let record = MutationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identity: self.scope.identity.clone(),
            mutation_name: mutation_name.to_string(),
            args,
            created_at,
            seq,
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        };
        self.save(&record)?;
        tracing::debug!(id = %record.id, mutation = mutation_name, "mutation enqueued");
        self.listeners.notify(&OutboxEvent::Enqueued {
            id: record.id.clone(),
        });
        Ok(record.id)
    }

    pub fn get(&self, id: &str) -> Result<Option<MutationRecord>> {
        read_json(&*self.backend, &self.scope, id)
    }

    /// `pending` and `failed` records, oldest first.
    pub fn get_pending(&self) -> Result<Vec<MutationRecord>> {
        let mut records: Vec<MutationRecord> = self
            .load_all()?
            .into_iter()
            .filter(MutationRecord::is_eligible)
            .collect();
        records.sort_by_key(|r| (r.created_at, r.seq));
        Ok(records)
    }

    pub fn get_stats(&self) -> Result<OutboxStats> {
        let mut stats = OutboxStats::default();
        for record in self.load_all()? {
            match record.status {
                MutationStatus::Pending => stats.pending += 1,
                MutationStatus::Processing => stats.processing += 1,
                MutationStatus::Failed => stats.failed += 1,
                MutationStatus::Synced => {}
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    /// Drop a queued mutation. A record that is being executed is left
    /// alone and `false` is returned.
    pub fn remove(&self, id: &str) -> Result<bool> {
        {
            let _claim = self.claim.lock();
            match self.get(id)? {
                Some(record) if record.status != MutationStatus::Processing => {
                    self.backend.delete(&self.scope, id)?;
                }
                _ => return Ok(false),
            }
        }
        self.listeners.notify(&OutboxEvent::Removed { id: id.to_string() });
        Ok(true)
    }

    /// Drain every eligible record in `(created_at, seq)` order.
    ///
    /// Only one drain runs at a time; a concurrent call returns an empty
    /// result immediately. Individual failures are recorded on the record
    /// and do not stop the drain. Records removed while the drain is running
    /// are skipped and counted in neither total.
    ///
    /// Records still `processing` from a drain that ended on a storage error
    /// are returned to `pending` first, so they run again.
    pub async fn process(&self) -> Result<ProcessResult> {
        let executor = self.executor()?;
        let Some(_guard) = self.try_acquire() else {
            tracing::debug!(identity = %self.scope.identity, "drain already in progress");
            return Ok(ProcessResult::default());
        };

        self.reset_interrupted()?;
        let ids: Vec<String> = self.get_pending()?.into_iter().map(|r| r.id).collect();
        tracing::debug!(identity = %self.scope.identity, count = ids.len(), "outbox drain started");

        let mut result = ProcessResult::default();
        for id in ids {
            match self.execute_one(&*executor, &id, MutationRecord::is_eligible).await? {
                Some(true) => result.success += 1,
                Some(false) => result.failed += 1,
                None => tracing::debug!(id = %id, "mutation no longer queued; skipped"),
            }
        }
        self.purge_synced()?;

        tracing::debug!(
            identity = %self.scope.identity,
            success = result.success,
            failed = result.failed,
            "outbox drain finished"
        );
        self.listeners.notify(&OutboxEvent::Drained(result));
        Ok(result)
    }

    /// Re-attempt one `failed` record outside a full drain.
    ///
    /// Returns `true` only when the record executed successfully. Returns
    /// `false` without executing when the record is not `failed` or a drain
    /// is running.
    pub async fn retry(&self, id: &str) -> Result<bool> {
        let executor = self.executor()?;
        let Some(_guard) = self.try_acquire() else {
            return Ok(false);
        };
        let outcome = self
            .execute_one(&*executor, id, |r| r.status == MutationStatus::Failed)
            .await?;
        Ok(outcome == Some(true))
    }

    fn executor(&self) -> Result<Arc<dyn MutationExecutor>> {
        self.executor.lock().clone().ok_or(CacheError::ExecutorNotSet)
    }

    fn try_acquire(&self) -> Option<DrainGuard<'_>> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(&self.draining))
    }

    /// Claim `id` if it is still stored and `claimable`, then execute it.
    /// `None` when the record was not claimed.
    async fn execute_one(
        &self,
        executor: &dyn MutationExecutor,
        id: &str,
        claimable: impl Fn(&MutationRecord) -> bool,
    ) -> Result<Option<bool>> {
        let mut record = {
            let _claim = self.claim.lock();
            let Some(mut record) = self.get(id)?.filter(|r| claimable(r)) else {
                return Ok(None);
            };
            record.status = MutationStatus::Processing;
            record.last_attempt_at = Some(crate::now_ms());
            self.save(&record)?;
            record
        };
        self.listeners.notify(&OutboxEvent::Processing {
            id: record.id.clone(),
        });

        let outcome = match tokio::time::timeout(
            self.timeout,
            executor.execute(&record.mutation_name, record.args.clone()),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MutationError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(()) => {
                record.status = MutationStatus::Synced;
                self.save(&record)?;
                self.backend.delete(&self.scope, &record.id)?;
                self.listeners.notify(&OutboxEvent::Synced { id: record.id });
                Ok(Some(true))
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(
                    id = %record.id,
                    mutation = %record.mutation_name,
                    error = %error,
                    "mutation failed"
                );
                record.status = MutationStatus::Failed;
                record.attempts += 1;
                record.last_error = Some(error.clone());
                self.save(&record)?;
                self.listeners.notify(&OutboxEvent::Failed {
                    id: record.id,
                    error,
                });
                Ok(Some(false))
            }
        }
    }

    fn purge_synced(&self) -> Result<()> {
        for record in self.load_all()? {
            if record.status == MutationStatus::Synced {
                self.backend.delete(&self.scope, &record.id)?;
            }
        }
        Ok(())
    }

    fn save(&self, record: &MutationRecord) -> Result<()> {
        write_json(&*self.backend, &self.scope, &record.id, record)
    }

    fn load_all(&self) -> Result<Vec<MutationRecord>> {
        let mut records = Vec::new();
        for (key, bytes) in self.backend.scan(&self.scope)? {
            match serde_json::from_slice::<MutationRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable outbox record"),
            }
        }
        Ok(records)
    }
}
