//! Per-job execution context.
//!
//! One `JobContext` is created per execution task and handed to the
//! running module. It mediates every StateStore and LogHub write for its
//! job and carries the cooperative cancellation flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::engine::job::{JsonMap, LogLevel};
use crate::engine::loghub::LogHub;
use crate::error::StoreError;
use crate::store::StateStore;

/// Handle passed to running module code.
pub struct JobContext {
    job_id: Uuid,
    store: Arc<dyn StateStore>,
    hub: Arc<LogHub>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl JobContext {
    /// Create a context for one job.
    pub fn new(job_id: Uuid, store: Arc<dyn StateStore>, hub: Arc<LogHub>) -> Self {
        Self {
            job_id,
            store,
            hub,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    /// The job this context belongs to.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// True after `cancel()` was called (by `stop_job` or the watchdog).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation. Idempotent; does not interrupt running
    /// module code — modules observe the flag cooperatively.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.cancel_notify.notify_waiters();
        }
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Append a log entry for this job and fan it out to subscribers.
    ///
    /// The durable write happens first; subscribers never observe an
    /// entry that is not yet recorded.
    pub async fn log(&self, level: LogLevel, message: impl AsRef<str>) -> Result<(), StoreError> {
        let message = message.as_ref();
        let entry = self.store.append_log(self.job_id, level, message).await?;
        tracing::debug!(job_id = %self.job_id, seq = entry.seq, %level, "{message}");
        self.hub.publish(self.job_id, entry).await;
        Ok(())
    }

    /// Append one result record for this job.
    pub async fn save_result(&self, data: serde_json::Value) -> Result<(), StoreError> {
        self.store.append_result(self.job_id, &data).await?;
        Ok(())
    }

    /// Overwrite this job's checkpoint. Last write wins.
    pub async fn save_checkpoint(&self, checkpoint: &JsonMap) -> Result<(), StoreError> {
        self.store.update_checkpoint(self.job_id, checkpoint).await
    }
}
