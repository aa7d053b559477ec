//! Job scheduler — launches, tracks, cancels, and resumes module jobs.
//!
//! One execution task drives each active job; the scheduler's in-memory
//! registry holds the task handle and `JobContext` for every non-terminal
//! job it launched. The persisted `running` status always means "a task
//! is believed to be driving this job in some process" — startup recovery
//! reconciles rows left `running` by a crashed process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::duration::{format_uptime, parse_duration};
use crate::engine::context::JobContext;
use crate::engine::job::{JobRecord, JobStatus, JsonMap, LogLevel};
use crate::engine::loghub::{LogHub, LogStream};
use crate::engine::watchdog;
use crate::error::{Error, JobError, ModuleError, Result};
use crate::modules::{ModuleFactory, ModuleRegistry};
use crate::store::StateStore;

/// How often `stop_job` re-checks the active registry while waiting for
/// the execution task to wind down.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Attempts for the terminal-status write before giving up.
const FINALIZE_ATTEMPTS: u32 = 3;

/// Base backoff between terminal-status write attempts.
const FINALIZE_BACKOFF: Duration = Duration::from_millis(100);

/// Optional parameters for `start_job`.
#[derive(Default)]
pub struct StartOptions {
    /// Module settings.
    pub settings: JsonMap,
    /// Initial checkpoint (explicit re-run from a prior state).
    pub checkpoint: Option<JsonMap>,
    /// Wall-clock budget string, e.g. `30m`, `2h`, `7d`.
    pub max_duration: Option<String>,
}

/// Read-only scheduler snapshot.
#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    pub status: &'static str,
    pub uptime: String,
    pub module_count: usize,
    pub jobs: Vec<ActiveJobInfo>,
}

/// One active job in the status snapshot.
#[derive(Debug, Serialize)]
pub struct ActiveJobInfo {
    pub id: Uuid,
    pub module: String,
    pub status: JobStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Tracked state for one active job.
struct ActiveJob {
    context: Arc<JobContext>,
    handle: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
}

/// State shared between the scheduler handle and its execution tasks.
struct SchedulerInner {
    config: Config,
    store: Arc<dyn StateStore>,
    modules: Arc<ModuleRegistry>,
    hub: Arc<LogHub>,
    active: RwLock<HashMap<Uuid, ActiveJob>>,
}

/// Manages async job execution.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    started_at: Instant,
}

impl JobScheduler {
    /// Create a scheduler over the given store and module registry.
    pub fn new(config: Config, store: Arc<dyn StateStore>, modules: Arc<ModuleRegistry>) -> Self {
        let hub = Arc::new(LogHub::with_capacity(config.log_channel_capacity));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                modules,
                hub,
                active: RwLock::new(HashMap::new()),
            }),
            started_at: Instant::now(),
        }
    }

    /// Access the underlying state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    /// Access the module registry.
    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.inner.modules
    }

    /// Start a new job.
    ///
    /// Resolves the module and validates declared inputs before any row
    /// is persisted; an unknown module or invalid inputs leave no trace.
    pub async fn start_job(
        &self,
        module_id: &str,
        inputs: JsonMap,
        options: StartOptions,
    ) -> Result<Uuid> {
        let factory = self.inner.modules.resolve(module_id).await?;
        let inputs = factory.manifest().validate_inputs(&inputs)?;
        let budget = options
            .max_duration
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(JobError::from)?;

        let record = JobRecord::new(module_id, inputs, options.settings)
            .with_checkpoint(options.checkpoint)
            .with_max_duration(options.max_duration);
        let job_id = record.id;
        self.inner.store.insert_job(&record).await.map_err(Error::from)?;

        self.launch(record, factory, budget).await?;
        tracing::info!(job_id = %job_id, module = module_id, "Job started");
        Ok(job_id)
    }

    /// Re-enter execution for an existing job row, restoring its
    /// persisted checkpoint before the first module call.
    ///
    /// Used by startup recovery and explicit re-runs of interrupted jobs;
    /// a job that already reached a terminal status cannot be re-entered.
    pub async fn resume_job(&self, record: JobRecord) -> Result<()> {
        if record.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: record.id,
                from: record.status.to_string(),
                to: JobStatus::Running.to_string(),
            }
            .into());
        }

        let factory = self.inner.modules.resolve(&record.module_id).await?;
        let budget = match record.max_duration.as_deref().map(parse_duration).transpose() {
            Ok(budget) => budget,
            Err(e) => {
                tracing::warn!(job_id = %record.id, error = %e,
                    "Ignoring unparseable persisted duration budget");
                None
            }
        };

        let job_id = record.id;
        self.launch(record, factory, budget).await?;
        tracing::info!(job_id = %job_id, "Job resumed");
        Ok(())
    }

    /// Resume every job left `running` by a prior process.
    ///
    /// Jobs whose module can no longer be resolved are transitioned
    /// directly to `failed` rather than left dangling in `running`.
    pub async fn resume_interrupted_jobs(&self) -> usize {
        let interrupted = match self.inner.store.list_jobs(Some(JobStatus::Running)).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query interrupted jobs");
                return 0;
            }
        };

        let mut count = 0;
        for record in interrupted {
            let job_id = record.id;
            match self.resume_job(record).await {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not resume job");
                    finalize(
                        &self.inner,
                        job_id,
                        JobStatus::Failed,
                        Some(format!("Could not resume after restart: {e}")),
                    )
                    .await;
                }
            }
        }
        count
    }

    /// Signal cancellation to an active job and wait for its execution
    /// task to retire. Returns whether an active job was found.
    pub async fn stop_job(&self, job_id: Uuid) -> bool {
        {
            let active = self.inner.active.read().await;
            match active.get(&job_id) {
                Some(job) => job.context.cancel(),
                None => return false,
            }
        }

        // The execution task removes itself from the registry once the
        // module winds down (bounded by the cancellation grace period).
        let deadline = Instant::now() + self.inner.config.cancel_grace + Duration::from_secs(2);
        while self.inner.active.read().await.contains_key(&job_id) {
            if Instant::now() > deadline {
                tracing::warn!(job_id = %job_id, "Job did not retire within the grace period");
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        true
    }

    /// Read-only snapshot of the scheduler.
    pub async fn status(&self) -> SchedulerStatus {
        let module_count = self.inner.modules.list().await.len();
        let ids: Vec<Uuid> = self.inner.active.read().await.keys().copied().collect();

        let jobs = join_all(ids.into_iter().map(|id| {
            let store = Arc::clone(&self.inner.store);
            async move { store.get_job(id).await.ok().flatten() }
        }))
        .await
        .into_iter()
        .flatten()
        .map(|record| ActiveJobInfo {
            id: record.id,
            module: record.module_id,
            status: record.status,
            started_at: record.started_at,
        })
        .collect();

        SchedulerStatus {
            status: "running",
            uptime: format_uptime(self.started_at.elapsed()),
            module_count,
            jobs,
        }
    }

    /// Subscribe to a job's live log stream.
    ///
    /// A job that is already terminal (or unknown) yields a stream that
    /// ends immediately, so a late subscriber never hangs.
    pub async fn subscribe_logs(&self, job_id: Uuid) -> LogStream {
        if self.inner.active.read().await.contains_key(&job_id) {
            return self.inner.hub.subscribe(job_id).await;
        }
        match self.inner.store.get_job(job_id).await {
            Ok(Some(record)) if !record.status.is_terminal() => {
                self.inner.hub.subscribe(job_id).await
            }
            _ => LogHub::closed_stream(),
        }
    }

    /// Number of currently active jobs.
    pub async fn active_count(&self) -> usize {
        self.inner.active.read().await.len()
    }

    /// Check whether a job has a live execution task.
    pub async fn is_active(&self, job_id: Uuid) -> bool {
        self.inner.active.read().await.contains_key(&job_id)
    }

    /// Cancel all active jobs, wait for them to retire, and close every
    /// subscriber stream. Called at daemon shutdown.
    pub async fn shutdown(&self) {
        {
            let active = self.inner.active.read().await;
            for job in active.values() {
                job.context.cancel();
            }
        }

        let deadline = Instant::now() + self.inner.config.cancel_grace + Duration::from_secs(2);
        while !self.inner.active.read().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        let mut active = self.inner.active.write().await;
        for (job_id, job) in active.drain() {
            tracing::warn!(job_id = %job_id, "Aborting job still active at shutdown");
            job.handle.abort();
            if let Some(watchdog) = job.watchdog {
                watchdog.abort();
            }
        }
        drop(active);

        self.inner.hub.close_all().await;
        tracing::info!("Scheduler shut down");
    }

    /// Insert the active-registry entry and spawn the execution task.
    ///
    /// Holding the registry write lock across the spawn guarantees
    /// at-most-one execution task per job id even under concurrent
    /// start/resume calls.
    async fn launch(
        &self,
        record: JobRecord,
        factory: Arc<dyn ModuleFactory>,
        budget: Option<Duration>,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let mut active = self.inner.active.write().await;

        if let Some(existing) = active.get(&record.id) {
            if !existing.handle.is_finished() {
                return Err(JobError::AlreadyActive { id: record.id }.into());
            }
        }

        let job_id = record.id;
        let context = Arc::new(JobContext::new(
            job_id,
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.hub),
        ));

        let watchdog = budget.map(|budget| {
            let label = record.max_duration.clone().unwrap_or_default();
            watchdog::spawn(Arc::clone(&context), budget, label)
        });

        let handle = tokio::spawn(execute_job(inner, record, factory, Arc::clone(&context)));

        active.insert(
            job_id,
            ActiveJob {
                context,
                handle,
                watchdog,
            },
        );
        Ok(())
    }
}

/// Outcome of driving a module to rest.
enum RunOutcome {
    /// Producer finished its result sequence and returned.
    Finished(std::result::Result<std::result::Result<(), ModuleError>, tokio::task::JoinError>),
    /// Cancellation grace period expired; the producer was aborted.
    GraceExpired,
    /// The engine failed persisting module output.
    EngineError(crate::error::StoreError),
}

/// Drive one job: transition to running, run the module, decide the
/// terminal status, finalize, and clean up.
async fn execute_job(
    inner: Arc<SchedulerInner>,
    record: JobRecord,
    factory: Arc<dyn ModuleFactory>,
    ctx: Arc<JobContext>,
) {
    let job_id = record.id;
    let (status, error) = drive_module(&inner, record, factory, Arc::clone(&ctx)).await;

    finalize(&inner, job_id, status, error).await;
    cleanup(&inner, job_id).await;
}

/// Run the module and decide the job's terminal status.
async fn drive_module(
    inner: &Arc<SchedulerInner>,
    record: JobRecord,
    factory: Arc<dyn ModuleFactory>,
    ctx: Arc<JobContext>,
) -> (JobStatus, Option<String>) {
    let job_id = record.id;

    if let Err(e) = inner
        .store
        .update_job_status(job_id, JobStatus::Running, None)
        .await
    {
        return (JobStatus::Failed, Some(format!("Failed to mark running: {e}")));
    }

    let _ = ctx
        .log(
            LogLevel::Info,
            format!("Starting job with module: {}", record.module_id),
        )
        .await;

    let mut module = factory.create();
    if let Some(checkpoint) = &record.checkpoint {
        let _ = ctx.log(LogLevel::Info, "Resuming from checkpoint").await;
        module.restore(checkpoint);
    }

    let (tx, mut rx) = mpsc::channel::<serde_json::Value>(inner.config.result_channel_capacity);
    let producer = {
        let ctx = Arc::clone(&ctx);
        let inputs = record.inputs.clone();
        let settings = record.settings.clone();
        tokio::spawn(async move { module.run(ctx, inputs, settings, tx).await })
    };

    // Completes only after cancellation has been requested AND the grace
    // period has elapsed; until then the select below keeps draining.
    let grace_timer = {
        let ctx = Arc::clone(&ctx);
        let grace = inner.config.cancel_grace;
        async move {
            ctx.cancelled().await;
            tokio::time::sleep(grace).await;
        }
    };
    tokio::pin!(grace_timer);

    let outcome = loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(data) => {
                    if ctx.is_cancelled() {
                        // The job is stopping; discard late output.
                        continue;
                    }
                    if let Err(e) = ctx.save_result(data).await {
                        producer.abort();
                        break RunOutcome::EngineError(e);
                    }
                }
                None => break RunOutcome::Finished(producer.await),
            },
            _ = &mut grace_timer => {
                producer.abort();
                break RunOutcome::GraceExpired;
            }
        }
    };

    match outcome {
        RunOutcome::Finished(Ok(Ok(()))) => {
            if ctx.is_cancelled() {
                let _ = ctx.log(LogLevel::Info, "Job cancelled").await;
                (JobStatus::Stopped, None)
            } else {
                let _ = ctx.log(LogLevel::Info, "Job completed successfully").await;
                (JobStatus::Completed, None)
            }
        }
        RunOutcome::Finished(Ok(Err(module_err))) => {
            if ctx.is_cancelled() {
                // Cancellation is not an error; note the wind-down failure.
                let _ = ctx
                    .log(
                        LogLevel::Warning,
                        format!("Module error during cancellation: {module_err}"),
                    )
                    .await;
                let _ = ctx.log(LogLevel::Info, "Job cancelled").await;
                (JobStatus::Stopped, None)
            } else {
                let message = module_err.to_string();
                let _ = ctx
                    .log(LogLevel::Error, format!("Job failed: {message}"))
                    .await;
                (JobStatus::Failed, Some(message))
            }
        }
        RunOutcome::Finished(Err(join_err)) => {
            if ctx.is_cancelled() {
                let _ = ctx.log(LogLevel::Info, "Job cancelled").await;
                (JobStatus::Stopped, None)
            } else {
                let message = format!("Module panicked: {join_err}");
                let _ = ctx
                    .log(LogLevel::Error, format!("Job failed: {message}"))
                    .await;
                (JobStatus::Failed, Some(message))
            }
        }
        RunOutcome::GraceExpired => {
            let _ = ctx
                .log(
                    LogLevel::Warning,
                    "Cancellation grace period expired - forcibly retiring job",
                )
                .await;
            (JobStatus::Stopped, None)
        }
        RunOutcome::EngineError(e) => {
            let message = format!("Failed to persist result: {e}");
            let _ = ctx
                .log(LogLevel::Error, format!("Job failed: {message}"))
                .await;
            (JobStatus::Failed, Some(message))
        }
    }
}

/// Write the terminal status with bounded backoff.
///
/// Gives up after `FINALIZE_ATTEMPTS`, leaving the row in its last
/// persisted state; the job is never silently reported terminal without
/// a durable write succeeding.
async fn finalize(
    inner: &Arc<SchedulerInner>,
    job_id: Uuid,
    status: JobStatus,
    error: Option<String>,
) {
    let mut attempt = 1;
    loop {
        match inner
            .store
            .update_job_status(job_id, status, error.as_deref())
            .await
        {
            Ok(()) => return,
            Err(e) if attempt < FINALIZE_ATTEMPTS => {
                tracing::warn!(
                    job_id = %job_id, %status, attempt, error = %e,
                    "Terminal status write failed, retrying"
                );
                tokio::time::sleep(FINALIZE_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job_id, %status, error = %e,
                    "Giving up on terminal status write; job left in last persisted state"
                );
                return;
            }
        }
    }
}

/// Retire a finished job: drop the registry entry, stop its watchdog,
/// and close the subscriber streams.
async fn cleanup(inner: &Arc<SchedulerInner>, job_id: Uuid) {
    let entry = inner.active.write().await.remove(&job_id);
    if let Some(job) = entry {
        if let Some(watchdog) = job.watchdog {
            watchdog.abort();
        }
    }
    inner.hub.close(job_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::job::JsonMap;
    use crate::modules::builtin;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn scheduler() -> JobScheduler {
        let store: Arc<dyn StateStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let modules = Arc::new(ModuleRegistry::new());
        builtin::register_builtin(&modules);
        JobScheduler::new(Config::default(), store, modules)
    }

    fn echo_inputs(text: &str) -> JsonMap {
        let mut inputs = JsonMap::new();
        inputs.insert("text".into(), json!(text));
        inputs
    }

    async fn wait_terminal(sched: &JobScheduler, job_id: Uuid) -> JobRecord {
        for _ in 0..200 {
            let record = sched.store().get_job(job_id).await.unwrap().unwrap();
            if record.status.is_terminal() && !sched.is_active(job_id).await {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn unknown_module_fails_without_creating_a_row() {
        let sched = scheduler().await;
        let err = sched
            .start_job("bad-module", JsonMap::new(), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Module(ModuleError::NotFound { ref id }) if id == "bad-module"
        ));
        assert!(sched.store().list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_required_input_is_rejected_outright() {
        let sched = scheduler().await;
        let err = sched
            .start_job("echo", JsonMap::new(), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Module(ModuleError::InvalidInputs { .. })));
        assert!(sched.store().list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_duration_is_rejected() {
        let sched = scheduler().await;
        let err = sched
            .start_job(
                "echo",
                echo_inputs("hi"),
                StartOptions {
                    max_duration: Some("90 minutes".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidDuration(_))));
        assert!(sched.store().list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn echo_job_completes_with_one_result() {
        let sched = scheduler().await;
        let job_id = sched
            .start_job("echo", echo_inputs("hi"), StartOptions::default())
            .await
            .unwrap();

        let record = wait_terminal(&sched, job_id).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());

        let results = sched.store().list_results(job_id, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data, json!({"data": "hi"}));
    }

    #[tokio::test]
    async fn stop_unknown_job_returns_false() {
        let sched = scheduler().await;
        assert!(!sched.stop_job(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn status_snapshot_reports_modules_and_uptime() {
        let sched = scheduler().await;
        let status = sched.status().await;
        assert_eq!(status.status, "running");
        assert_eq!(status.module_count, 2);
        assert!(status.jobs.is_empty());
        assert!(!status.uptime.is_empty());
    }

    #[tokio::test]
    async fn resume_rejects_terminal_jobs() {
        let sched = scheduler().await;
        let job_id = sched
            .start_job("echo", echo_inputs("done"), StartOptions::default())
            .await
            .unwrap();
        let record = wait_terminal(&sched, job_id).await;

        let err = sched.resume_job(record).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn subscribe_to_terminal_job_ends_immediately() {
        let sched = scheduler().await;
        let job_id = sched
            .start_job("echo", echo_inputs("bye"), StartOptions::default())
            .await
            .unwrap();
        wait_terminal(&sched, job_id).await;

        let mut stream = sched.subscribe_logs(job_id).await;
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream must not hang");
        assert!(matches!(
            first,
            Some(crate::engine::loghub::LogStreamEvent::Closed)
        ));
    }
}
