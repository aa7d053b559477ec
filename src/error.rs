//! Error types for Taskmill.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Module resolution and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Module not found: {id}")]
    NotFound { id: String },

    #[error("Module {id} could not be loaded: {reason}")]
    LoadFailed { id: String, reason: String },

    #[error("Invalid inputs for module {module}: {reason}")]
    InvalidInputs { module: String, reason: String },

    #[error("Module execution failed: {0}")]
    Failed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} already has an active execution task")]
    AlreadyActive { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Invalid duration: {0}")]
    InvalidDuration(#[from] crate::duration::DurationParseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
