//! Job execution engine.
//!
//! Core components:
//! - `job` — job records, log/result entries, and the status state machine
//! - `context` — per-job handle mediating persistence and cancellation
//! - `loghub` — pub/sub fan-out of log entries to live subscribers
//! - `watchdog` — duration-limited force-cancellation
//! - `scheduler` — job launch, tracking, stop, and startup recovery

pub mod context;
pub mod job;
pub mod loghub;
pub mod scheduler;
pub mod watchdog;

pub use context::JobContext;
pub use job::{JobRecord, JobStatus, JsonMap, LogEntry, LogLevel, ResultEntry};
pub use loghub::{LogHub, LogStream, LogStreamEvent};
pub use scheduler::{JobScheduler, SchedulerStatus, StartOptions};
