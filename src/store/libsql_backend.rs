//! libSQL backend — async `StateStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::info;
use uuid::Uuid;

use crate::engine::job::{JobRecord, JobStatus, JsonMap, LogEntry, LogLevel, ResultEntry};
use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::StateStore;

/// Column list shared by every jobs SELECT. Keep in sync with `row_to_job`.
const JOB_COLUMNS: &str =
    "id, module_id, status, inputs, settings, checkpoint, max_duration, \
     created_at, started_at, finished_at, error";

/// libSQL state store backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.map(parse_datetime)
}

/// Parse a JSON object column; empty or malformed text maps to an empty map.
fn parse_map(s: Option<&str>) -> JsonMap {
    s.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

/// Map a libsql row to a JobRecord.
///
/// Column order matches JOB_COLUMNS:
/// 0:id, 1:module_id, 2:status, 3:inputs, 4:settings, 5:checkpoint,
/// 6:max_duration, 7:created_at, 8:started_at, 9:finished_at, 10:error
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("Failed to read job id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Serialization(format!("Invalid job id {id_str}: {e}")))?;

    let module_id: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("Failed to read module_id: {e}")))?;
    let status_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("Failed to read status: {e}")))?;
    let inputs_str: Option<String> = row.get(3).ok();
    let settings_str: Option<String> = row.get(4).ok();
    let checkpoint_str: Option<String> = row.get(5).ok();
    let max_duration: Option<String> = row.get(6).ok();
    let created_str: String = row
        .get(7)
        .map_err(|e| StoreError::Query(format!("Failed to read created_at: {e}")))?;
    let started_str: Option<String> = row.get(8).ok();
    let finished_str: Option<String> = row.get(9).ok();
    let error: Option<String> = row.get(10).ok();

    Ok(JobRecord {
        id,
        module_id,
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Pending),
        inputs: parse_map(inputs_str.as_deref()),
        settings: parse_map(settings_str.as_deref()),
        checkpoint: checkpoint_str
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        max_duration,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(started_str.as_deref()),
        finished_at: parse_optional_datetime(finished_str.as_deref()),
        error,
    })
}

#[async_trait]
impl StateStore for LibSqlBackend {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let inputs = serde_json::to_string(&job.inputs)?;
        let settings = serde_json::to_string(&job.settings)?;
        let checkpoint: libsql::Value = match &job.checkpoint {
            Some(cp) => libsql::Value::Text(serde_json::to_string(cp)?),
            None => libsql::Value::Null,
        };
        let max_duration: libsql::Value = match &job.max_duration {
            Some(d) => libsql::Value::Text(d.clone()),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                "INSERT INTO jobs (id, module_id, status, inputs, settings, checkpoint, \
                 max_duration, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id.to_string(),
                    job.module_id.clone(),
                    job.status.to_string(),
                    inputs,
                    settings,
                    checkpoint,
                    max_duration,
                    job.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to insert job: {e}")))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to query job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read job row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_job(&self, prefix: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 OR id LIKE ?2 LIMIT 1"
                ),
                params![prefix, format!("{prefix}%")],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to query job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read job row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError> {
        let mut rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 \
                         ORDER BY created_at DESC"
                    ),
                    params![status.to_string()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"),
                    (),
                )
                .await,
        }
        .map_err(|e| StoreError::Query(format!("Failed to list jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read job row: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let error: libsql::Value = match error {
            Some(message) => libsql::Value::Text(message.to_string()),
            None => libsql::Value::Null,
        };

        let affected = if status == JobStatus::Running {
            self.conn()
                .execute(
                    "UPDATE jobs SET status = ?1, started_at = ?2 WHERE id = ?3",
                    params![status.to_string(), now, id.to_string()],
                )
                .await
        } else if status.is_terminal() {
            self.conn()
                .execute(
                    "UPDATE jobs SET status = ?1, finished_at = ?2, error = ?3 WHERE id = ?4",
                    params![status.to_string(), now, error, id.to_string()],
                )
                .await
        } else {
            self.conn()
                .execute(
                    "UPDATE jobs SET status = ?1 WHERE id = ?2",
                    params![status.to_string(), id.to_string()],
                )
                .await
        }
        .map_err(|e| StoreError::Query(format!("Failed to update job status: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "job".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_checkpoint(&self, id: Uuid, checkpoint: &JsonMap) -> Result<(), StoreError> {
        let blob = serde_json::to_string(checkpoint)?;
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET checkpoint = ?1 WHERE id = ?2",
                params![blob, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to update checkpoint: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "job".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_log(
        &self,
        id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> Result<LogEntry, StoreError> {
        let timestamp = Utc::now();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO job_logs (job_id, seq, level, message, timestamp)
                 VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_logs WHERE job_id = ?1), \
                 ?2, ?3, ?4)
                 RETURNING seq",
                params![
                    id.to_string(),
                    level.as_str(),
                    message,
                    timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to append log: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read log seq: {e}")))?
            .ok_or_else(|| StoreError::Query("Log insert returned no row".to_string()))?;
        let seq: i64 = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("Failed to parse log seq: {e}")))?;

        Ok(LogEntry {
            seq,
            level,
            message: message.to_string(),
            timestamp,
        })
    }

    async fn list_logs(
        &self,
        id: Uuid,
        limit: usize,
        after_seq: Option<i64>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let mut rows = match after_seq {
            Some(after) => self
                .conn()
                .query(
                    "SELECT seq, level, message, timestamp FROM job_logs
                     WHERE job_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
                    params![id.to_string(), after, limit as i64],
                )
                .await,
            None => self
                .conn()
                .query(
                    "SELECT seq, level, message, timestamp FROM job_logs
                     WHERE job_id = ?1 ORDER BY seq DESC LIMIT ?2",
                    params![id.to_string(), limit as i64],
                )
                .await,
        }
        .map_err(|e| StoreError::Query(format!("Failed to list logs: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read log row: {e}")))?
        {
            let seq: i64 = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("Failed to read log seq: {e}")))?;
            let level_str: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("Failed to read log level: {e}")))?;
            let message: String = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("Failed to read log message: {e}")))?;
            let ts_str: String = row
                .get(3)
                .map_err(|e| StoreError::Query(format!("Failed to read log timestamp: {e}")))?;

            entries.push(LogEntry {
                seq,
                level: LogLevel::parse(&level_str),
                message,
                timestamp: parse_datetime(&ts_str),
            });
        }

        // The no-cursor query walks backwards for the tail; restore order.
        if after_seq.is_none() {
            entries.reverse();
        }
        Ok(entries)
    }

    async fn append_result(
        &self,
        id: Uuid,
        data: &serde_json::Value,
    ) -> Result<ResultEntry, StoreError> {
        let created_at = Utc::now();
        let blob = serde_json::to_string(data)?;
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO job_results (job_id, seq, data, created_at)
                 VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_results \
                 WHERE job_id = ?1), ?2, ?3)
                 RETURNING seq",
                params![id.to_string(), blob, created_at.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to append result: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read result seq: {e}")))?
            .ok_or_else(|| StoreError::Query("Result insert returned no row".to_string()))?;
        let seq: i64 = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("Failed to parse result seq: {e}")))?;

        Ok(ResultEntry {
            seq,
            data: data.clone(),
            created_at,
        })
    }

    async fn list_results(&self, id: Uuid, limit: usize) -> Result<Vec<ResultEntry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT seq, data, created_at FROM job_results
                 WHERE job_id = ?1 ORDER BY seq LIMIT ?2",
                params![id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to list results: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read result row: {e}")))?
        {
            let seq: i64 = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("Failed to read result seq: {e}")))?;
            let data_str: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("Failed to read result data: {e}")))?;
            let ts_str: String = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("Failed to read result created_at: {e}")))?;

            entries.push(ResultEntry {
                seq,
                data: serde_json::from_str(&data_str)?,
                created_at: parse_datetime(&ts_str),
            });
        }
        Ok(entries)
    }

    async fn result_count(&self, id: Uuid) -> Result<i64, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM job_results WHERE job_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to count results: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read result count: {e}")))?;
        match row {
            Some(row) => row
                .get(0)
                .map_err(|e| StoreError::Query(format!("Failed to parse result count: {e}"))),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn sample_job() -> JobRecord {
        let mut inputs = JsonMap::new();
        inputs.insert("text".into(), json!("hi"));
        JobRecord::new("echo", inputs, JsonMap::new())
    }

    #[tokio::test]
    async fn insert_and_get_job() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.module_id, "echo");
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.inputs["text"], json!("hi"));
        assert!(fetched.checkpoint.is_none());
    }

    #[tokio::test]
    async fn get_missing_job_is_none() {
        let store = store().await;
        assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_job_by_prefix() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let prefix = &job.id.to_string()[..8];
        let found = store.find_job(prefix).await.unwrap().unwrap();
        assert_eq!(found.id, job.id);

        assert!(store.find_job("zzzzzzzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_update_stamps_timestamps() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        store
            .update_job_status(job.id, JobStatus::Running, None)
            .await
            .unwrap();
        let running = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        store
            .update_job_status(job.id, JobStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let failed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.finished_at.is_some());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn status_update_unknown_job_errors() {
        let store = store().await;
        let err = store
            .update_job_status(Uuid::new_v4(), JobStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn checkpoint_overwrites() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let mut cp = JsonMap::new();
        cp.insert("progress".into(), json!(3));
        store.update_checkpoint(job.id, &cp).await.unwrap();

        cp.insert("progress".into(), json!(7));
        store.update_checkpoint(job.id, &cp).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.checkpoint.unwrap()["progress"], json!(7));
    }

    #[tokio::test]
    async fn log_sequence_is_monotonic_per_job() {
        let store = store().await;
        let job_a = sample_job();
        let job_b = sample_job();
        store.insert_job(&job_a).await.unwrap();
        store.insert_job(&job_b).await.unwrap();

        let first = store
            .append_log(job_a.id, LogLevel::Info, "one")
            .await
            .unwrap();
        let second = store
            .append_log(job_a.id, LogLevel::Warning, "two")
            .await
            .unwrap();
        let other = store
            .append_log(job_b.id, LogLevel::Info, "separate")
            .await
            .unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        // Sequences are per-job, not global.
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn list_logs_tail_and_cursor() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        for i in 1..=5 {
            store
                .append_log(job.id, LogLevel::Info, &format!("line {i}"))
                .await
                .unwrap();
        }

        // Tail: last 3, in sequence order.
        let tail = store.list_logs(job.id, 3, None).await.unwrap();
        assert_eq!(
            tail.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );

        // Cursor: strictly after seq 3.
        let after = store.list_logs(job.id, 100, Some(3)).await.unwrap();
        assert_eq!(
            after.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(after[0].message, "line 4");
    }

    #[tokio::test]
    async fn results_ordered_and_counted() {
        let store = store().await;
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        store
            .append_result(job.id, &json!({"n": 1}))
            .await
            .unwrap();
        store
            .append_result(job.id, &json!({"n": 2}))
            .await
            .unwrap();

        let results = store.list_results(job.id, 100).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].data, json!({"n": 1}));
        assert_eq!(results[1].data, json!({"n": 2}));
        assert_eq!(results[0].seq, 1);
        assert_eq!(results[1].seq, 2);

        assert_eq!(store.result_count(job.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_jobs_filters_by_status() {
        let store = store().await;
        let job_a = sample_job();
        let job_b = sample_job();
        store.insert_job(&job_a).await.unwrap();
        store.insert_job(&job_b).await.unwrap();
        store
            .update_job_status(job_b.id, JobStatus::Running, None)
            .await
            .unwrap();

        let running = store.list_jobs(Some(JobStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, job_b.id);

        let all = store.list_jobs(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn max_duration_round_trips() {
        let store = store().await;
        let job = sample_job().with_max_duration(Some("2h".to_string()));
        store.insert_job(&job).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.max_duration.as_deref(), Some("2h"));
    }
}
