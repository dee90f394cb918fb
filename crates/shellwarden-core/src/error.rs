//! Error taxonomy for the terminal subsystem

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a command failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionReason {
    /// Matches or is prefixed by an entry in the blocked-command set
    Blocked,
    /// Matches a dangerous-pattern rule
    DangerousPattern,
    /// References parent traversal, a home shortcut or a sensitive root
    PathTraversal,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Blocked => "blocked",
            RejectionReason::DangerousPattern => "dangerous-pattern",
            RejectionReason::PathTraversal => "path-traversal",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal subsystem errors
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Command validation failed ({reason}): {detail}")]
    ValidationRejected {
        reason: RejectionReason,
        detail: String,
    },

    #[error("Resource limit exceeded: {resource} at {actual:.1}, limit {limit:.1}")]
    ResourceExceeded {
        resource: String,
        actual: f64,
        limit: f64,
    },

    #[error("Too many concurrent executions (limit {limit})")]
    ConcurrencyExceeded { limit: usize },

    #[error("Command execution exceeded time limit of {limit_ms}ms")]
    ExecutionTimeout { limit_ms: u64 },

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Invalid terminal state snapshot: {0}")]
    SnapshotInvalid(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("PTY error: {0}")]
    Pty(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TerminalError {
    /// Validation, resource and concurrency failures never end a session
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, TerminalError::Pty(_) | TerminalError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, TerminalError>;
