use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbox lifecycle status of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    /// Being executed by the current drain. At most one per identity.
    Processing,
    Failed,
    /// Executed successfully; deleted right after.
    Synced,
}

/// A queued write, persisted in the identity's `Outbox` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub id: String,
    pub identity: String,
    pub mutation_name: String,
    pub args: Value,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Tiebreaker for records sharing `created_at`.
    pub seq: u64,
    pub status: MutationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<i64>,
}

impl MutationRecord {
    pub fn is_eligible(&self) -> bool {
        matches!(self.status, MutationStatus::Pending | MutationStatus::Failed)
    }
}

/// Counts from one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub total: usize,
}

/// Change notification published to outbox subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboxEvent {
    Enqueued { id: String },
    Processing { id: String },
    Synced { id: String },
    Failed { id: String, error: String },
    Removed { id: String },
    Drained(ProcessResult),
}
