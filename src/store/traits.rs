//! `StateStore` trait — single async interface for all job persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::job::{JobRecord, JobStatus, JsonMap, LogEntry, LogLevel, ResultEntry};
use crate::error::StoreError;

/// Backend-agnostic persistence trait covering jobs, logs, results, and
/// checkpoints.
///
/// Writes for a single job are serialized through that job's
/// `JobContext`; the store itself must tolerate concurrent writers
/// across different jobs.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job row.
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Get a job by its full id.
    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    /// Resolve a job by full id or unique id prefix.
    async fn find_job(&self, prefix: &str) -> Result<Option<JobRecord>, StoreError>;

    /// List jobs, newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError>;

    /// Update a job's status.
    ///
    /// Transitioning to `running` stamps `started_at`; transitioning to a
    /// terminal status stamps `finished_at` and records `error`.
    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Overwrite a job's checkpoint. Last write wins.
    async fn update_checkpoint(&self, id: Uuid, checkpoint: &JsonMap) -> Result<(), StoreError>;

    // ── Logs ────────────────────────────────────────────────────────

    /// Append a log entry, assigning the next per-job sequence number.
    /// Returns the persisted entry.
    async fn append_log(
        &self,
        id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> Result<LogEntry, StoreError>;

    /// List log entries in sequence order. With `after_seq` set, returns
    /// entries strictly after that sequence number (incremental polling);
    /// otherwise returns the most recent `limit` entries in order.
    async fn list_logs(
        &self,
        id: Uuid,
        limit: usize,
        after_seq: Option<i64>,
    ) -> Result<Vec<LogEntry>, StoreError>;

    // ── Results ─────────────────────────────────────────────────────

    /// Append a result entry, assigning the next per-job sequence number.
    /// Returns the persisted entry.
    async fn append_result(
        &self,
        id: Uuid,
        data: &serde_json::Value,
    ) -> Result<ResultEntry, StoreError>;

    /// List result entries in sequence order, up to `limit`.
    async fn list_results(&self, id: Uuid, limit: usize) -> Result<Vec<ResultEntry>, StoreError>;

    /// Count of result entries for a job.
    async fn result_count(&self, id: Uuid) -> Result<i64, StoreError>;
}
