//! Job records, log entries, and the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON object mapping used for inputs, settings, and checkpoints.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job row exists, execution task not yet driving it.
    Pending,
    /// An execution task is (believed to be) driving this job.
    Running,
    /// The module finished its result sequence without error.
    Completed,
    /// The module raised, or the engine failed while executing the job.
    Failed,
    /// Cancellation was observed and the job wound down.
    Stopped,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Parse a status from its persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A persisted job record.
///
/// The StateStore owns the durable copy; the scheduler's in-memory
/// registry is a non-authoritative cache of the active subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job ID.
    pub id: Uuid,
    /// Module this job runs.
    pub module_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Input parameters supplied at start.
    pub inputs: JsonMap,
    /// Module settings supplied at start.
    pub settings: JsonMap,
    /// Latest checkpoint, last-write-wins.
    pub checkpoint: Option<JsonMap>,
    /// Duration budget string as supplied (e.g. `2h`), kept for resume.
    pub max_duration: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When execution first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error message for failed jobs.
    pub error: Option<String>,
}

impl JobRecord {
    /// Create a new pending record for a start request.
    pub fn new(module_id: impl Into<String>, inputs: JsonMap, settings: JsonMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_id: module_id.into(),
            status: JobStatus::Pending,
            inputs,
            settings,
            checkpoint: None,
            max_duration: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Attach a duration budget string.
    pub fn with_max_duration(mut self, max_duration: Option<String>) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Attach an initial checkpoint (explicit re-run from a prior state).
    pub fn with_checkpoint(mut self, checkpoint: Option<JsonMap>) -> Self {
        self.checkpoint = checkpoint;
        self
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    /// Parse from the persisted string form, defaulting to `Info`.
    pub fn parse(s: &str) -> Self {
        match s {
            "DEBUG" => Self::Debug,
            "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One log line produced by a running job. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Per-job monotonically increasing sequence number.
    pub seq: i64,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One unit of output yielded by a running module. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Per-job monotonically increasing sequence number.
    pub seq: i64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stopped));
    }

    #[test]
    fn transitions_invalid() {
        // No skipping running, no leaving a terminal status.
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Stopped));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Stopped.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_display_and_parse_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
        ] {
            assert_eq!(JobStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn status_serde_matches_display() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::Running);
    }

    #[test]
    fn log_level_parse_defaults_to_info() {
        assert_eq!(LogLevel::parse("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::parse("unknown"), LogLevel::Info);
    }

    #[test]
    fn new_record_is_pending() {
        let record = JobRecord::new("echo", JsonMap::new(), JsonMap::new());
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.started_at.is_none());
        assert!(record.finished_at.is_none());
        assert!(record.checkpoint.is_none());
    }
}
