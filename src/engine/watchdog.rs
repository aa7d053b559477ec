//! Duration watchdog — force-cancels a job once its wall-clock budget
//! elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::engine::context::JobContext;
use crate::engine::job::LogLevel;

/// Spawn a watchdog for one job.
///
/// Sleeps for `budget`, then logs a notice through the job's context and
/// requests cancellation. Termination is still the module's cooperative
/// responsibility, backed by the scheduler's grace-period fallback. The
/// watchdog exits early if the job is cancelled first, and the scheduler
/// aborts it during cleanup, so it never outlives its job.
pub fn spawn(ctx: Arc<JobContext>, budget: Duration, label: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(budget) => {
                let _ = ctx
                    .log(
                        LogLevel::Info,
                        format!("Duration limit reached ({label}) - stopping job"),
                    )
                    .await;
                ctx.cancel();
            }
            _ = ctx.cancelled() => {}
        }
    })
}
