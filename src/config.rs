//! Configuration loaded from `TASKMILL_`-prefixed environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Address the HTTP/WebSocket API binds to.
    pub api_host: String,
    /// Port the HTTP/WebSocket API binds to.
    pub api_port: u16,
    /// Grace period after cancellation before the execution task is
    /// forcibly retired.
    pub cancel_grace: Duration,
    /// Capacity of each per-job log broadcast channel.
    pub log_channel_capacity: usize,
    /// Capacity of the bounded result channel between a module and its
    /// execution task.
    pub result_channel_capacity: usize,
    /// Keepalive interval for live log streams.
    pub stream_keepalive: Duration,
    /// Optional directory for daemon log files (daily rotation).
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/taskmill.db"),
            api_host: "127.0.0.1".to_string(),
            api_port: 8420,
            cancel_grace: Duration::from_secs(30),
            log_channel_capacity: 256,
            result_channel_capacity: 64,
            stream_keepalive: Duration::from_secs(30),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_path: std::env::var("TASKMILL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            api_host: std::env::var("TASKMILL_API_HOST").unwrap_or(defaults.api_host),
            api_port: env_parse("TASKMILL_API_PORT", defaults.api_port),
            cancel_grace: Duration::from_secs(env_parse(
                "TASKMILL_CANCEL_GRACE_SECS",
                defaults.cancel_grace.as_secs(),
            )),
            log_channel_capacity: env_parse(
                "TASKMILL_LOG_CHANNEL_CAPACITY",
                defaults.log_channel_capacity,
            ),
            result_channel_capacity: env_parse(
                "TASKMILL_RESULT_CHANNEL_CAPACITY",
                defaults.result_channel_capacity,
            ),
            stream_keepalive: Duration::from_secs(env_parse(
                "TASKMILL_STREAM_KEEPALIVE_SECS",
                defaults.stream_keepalive.as_secs(),
            )),
            log_dir: std::env::var("TASKMILL_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.api_port, 8420);
        assert_eq!(config.cancel_grace, Duration::from_secs(30));
        assert_eq!(config.log_channel_capacity, 256);
        assert!(config.log_dir.is_none());
    }
}
