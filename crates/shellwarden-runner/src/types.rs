//! Types for sandboxed command runs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Variables copied from the parent environment into the sandbox.
/// Everything else is cleared.
pub const PROPAGATED_ENV: &[&str] = &["PATH", "HOME", "TERM"];

/// PATH used when the parent process has none
pub const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Run configuration
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Command text, tokenized with POSIX word rules and executed directly
    pub command: String,
    /// Fixed working directory
    pub cwd: PathBuf,
    /// Hard execution timeout; SIGTERM is sent to the worker group when it fires
    pub timeout: Duration,
    /// Cap on captured output, in bytes
    pub max_output: usize,
    /// Time between SIGTERM and SIGKILL after a timeout
    pub kill_grace: Duration,
    /// The worker group is SIGKILLed at this age whether or not it finished
    pub max_lifetime: Duration,
    /// Complete child environment
    pub env: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            command: String::new(),
            cwd: std::env::temp_dir(),
            timeout: Duration::from_secs(30),
            max_output: 1024 * 1024,
            kill_grace: Duration::from_millis(500),
            max_lifetime: Duration::from_secs(32),
            env: sandbox_env(),
        }
    }
}

/// Build the minimized sandbox environment from the current process.
pub fn sandbox_env() -> Vec<(String, String)> {
    PROPAGATED_ENV
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .chain(
            std::env::var_os("PATH")
                .is_none()
                .then(|| ("PATH".to_string(), FALLBACK_PATH.to_string())),
        )
        .collect()
}

/// Outcome of one sandboxed run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    /// Combined stdout then stderr, at most `max_output` bytes
    pub output: String,
    /// Exit code; `None` when the worker was ended by a signal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Whether the timeout fired
    pub timed_out: bool,
    /// Whether any output was dropped by the cap
    pub truncated: bool,
    /// Wall time from spawn to reap
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Exited on its own with status 0
    pub fn exited_cleanly(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Cannot parse command: {0}")]
    Parse(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
