//! Core value types shared across the terminal subsystem

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TerminalError;

// ============ Session ============

/// A live PTY-backed shell session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
}

// ============ Execution ============

/// Category of an execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationRejected,
    ResourceExceeded,
    ConcurrencyExceeded,
    ExecutionTimeout,
    ExecutionFailed,
}

/// Cause attached to an unsuccessful [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&TerminalError> for ExecutionFailure {
    fn from(err: &TerminalError) -> Self {
        let kind = match err {
            TerminalError::ValidationRejected { .. } => FailureKind::ValidationRejected,
            TerminalError::ResourceExceeded { .. } => FailureKind::ResourceExceeded,
            TerminalError::ConcurrencyExceeded { .. } => FailureKind::ConcurrencyExceeded,
            TerminalError::ExecutionTimeout { .. } => FailureKind::ExecutionTimeout,
            _ => FailureKind::ExecutionFailed,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Result of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
}

impl ExecutionResult {
    /// Unsuccessful result carrying the error as its cause
    pub fn failed(output: impl Into<String>, err: &TerminalError) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(err.into()),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

// ============ Resources ============

/// Resource ceilings for sandboxed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    /// Hard execution timeout, milliseconds
    #[serde(rename = "maxExecutionTime")]
    pub max_execution_time_ms: u64,
    /// Output cap, bytes
    pub max_output: usize,
    /// Smoothed CPU ceiling, percent
    pub max_cpu_usage: f64,
    /// Resident memory ceiling for this process, bytes
    pub max_memory_usage: u64,
    pub max_file_descriptors: u32,
    pub max_network_connections: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000,
            max_output: 1024 * 1024,
            max_cpu_usage: 80.0,
            max_memory_usage: 1024 * 1024 * 1024,
            max_file_descriptors: 100,
            max_network_connections: 10,
        }
    }
}

impl ResourceLimits {
    /// Set one limit by key. Negative and non-finite values are rejected.
    pub fn set(&mut self, key: LimitKey, value: f64) -> Result<(), TerminalError> {
        if !value.is_finite() || value < 0.0 {
            return Err(TerminalError::InvalidConfig(format!(
                "{} must be a non-negative number, got {}",
                key, value
            )));
        }
        match key {
            LimitKey::MaxExecutionTime => self.max_execution_time_ms = value as u64,
            LimitKey::MaxOutput => self.max_output = value as usize,
            LimitKey::MaxCpuUsage => self.max_cpu_usage = value,
            LimitKey::MaxMemoryUsage => self.max_memory_usage = value as u64,
            LimitKey::MaxFileDescriptors => self.max_file_descriptors = value as u32,
            LimitKey::MaxNetworkConnections => self.max_network_connections = value as u32,
        }
        Ok(())
    }
}

/// Name of a runtime-settable resource limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKey {
    MaxExecutionTime,
    MaxOutput,
    MaxCpuUsage,
    MaxMemoryUsage,
    MaxFileDescriptors,
    MaxNetworkConnections,
}

impl LimitKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKey::MaxExecutionTime => "maxExecutionTime",
            LimitKey::MaxOutput => "maxOutput",
            LimitKey::MaxCpuUsage => "maxCpuUsage",
            LimitKey::MaxMemoryUsage => "maxMemoryUsage",
            LimitKey::MaxFileDescriptors => "maxFileDescriptors",
            LimitKey::MaxNetworkConnections => "maxNetworkConnections",
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitKey {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maxExecutionTime" => Ok(LimitKey::MaxExecutionTime),
            "maxOutput" => Ok(LimitKey::MaxOutput),
            "maxCpuUsage" => Ok(LimitKey::MaxCpuUsage),
            "maxMemoryUsage" => Ok(LimitKey::MaxMemoryUsage),
            "maxFileDescriptors" => Ok(LimitKey::MaxFileDescriptors),
            "maxNetworkConnections" => Ok(LimitKey::MaxNetworkConnections),
            other => Err(TerminalError::InvalidConfig(format!(
                "unknown resource limit: {}",
                other
            ))),
        }
    }
}

/// Smoothed resource readings, recomputed after every execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// EMA of OS-wide CPU utilization, percent
    pub cpu_usage: f64,
    /// Resident memory of this process, bytes
    pub memory_usage: u64,
    pub file_descriptors: u32,
    pub network_connections: u32,
}

// ============ Security Events ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    CommandBlocked,
    ResourceExceeded,
    AccessDenied,
    IsolationBreach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Audit record for a blocked action or a limit breach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub timestamp: i64,
    pub details: String,
    pub severity: Severity,
}

// ============ Terminal State ============

/// Canonical per-session terminal state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalState {
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub command_history: Vec<String>,
    pub process_tree: Vec<u32>,
}

/// Partial update for [`crate::StateManager::update_state`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_history: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_tree: Option<Vec<u32>>,
}

impl StatePatch {
    pub fn cwd(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn env(env: HashMap<String, String>) -> Self {
        Self {
            env: Some(env),
            ..Default::default()
        }
    }

    pub fn commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command_history: Some(commands.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn processes(pids: impl Into<Vec<u32>>) -> Self {
        Self {
            process_tree: Some(pids.into()),
            ..Default::default()
        }
    }
}

/// One category of state delta with its typed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StateDelta {
    Cwd(String),
    Env(HashMap<String, String>),
    Command(Vec<String>),
    Process(Vec<u32>),
}

impl StateDelta {
    pub fn kind(&self) -> &'static str {
        match self {
            StateDelta::Cwd(_) => "cwd",
            StateDelta::Env(_) => "env",
            StateDelta::Command(_) => "command",
            StateDelta::Process(_) => "process",
        }
    }
}

/// Audit-log entry for one actual delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    #[serde(flatten)]
    pub delta: StateDelta,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_key_roundtrip() {
        let keys = [
            LimitKey::MaxExecutionTime,
            LimitKey::MaxOutput,
            LimitKey::MaxCpuUsage,
            LimitKey::MaxMemoryUsage,
            LimitKey::MaxFileDescriptors,
            LimitKey::MaxNetworkConnections,
        ];
        for key in keys {
            assert_eq!(key.as_str().parse::<LimitKey>().unwrap(), key);
        }
        assert!("maxBananas".parse::<LimitKey>().is_err());
    }

    #[test]
    fn test_set_limit() {
        let mut limits = ResourceLimits::default();
        limits.set(LimitKey::MaxExecutionTime, 5000.0).unwrap();
        limits.set(LimitKey::MaxCpuUsage, 55.5).unwrap();
        assert_eq!(limits.max_execution_time_ms, 5000);
        assert_eq!(limits.max_cpu_usage, 55.5);

        assert!(limits.set(LimitKey::MaxOutput, -1.0).is_err());
        assert!(limits.set(LimitKey::MaxOutput, f64::NAN).is_err());
        assert_eq!(limits.max_output, 1024 * 1024);
    }

    #[test]
    fn test_limits_yaml_names() {
        let limits: ResourceLimits =
            serde_yaml::from_str("maxExecutionTime: 1000\nmaxCpuUsage: 50").unwrap();
        assert_eq!(limits.max_execution_time_ms, 1000);
        assert_eq!(limits.max_cpu_usage, 50.0);
        // Unspecified fields keep their defaults
        assert_eq!(limits.max_file_descriptors, 100);
    }

    #[test]
    fn test_state_change_serialization() {
        let change = StateChange {
            delta: StateDelta::Cwd("/tmp".to_string()),
            timestamp: 42,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "cwd", "data": "/tmp", "timestamp": 42})
        );
    }

    #[test]
    fn test_security_event_serialization() {
        let event = SecurityEvent {
            event_type: SecurityEventType::CommandBlocked,
            timestamp: 1,
            details: "rm -rf /".to_string(),
            severity: Severity::High,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "command_blocked");
        assert_eq!(json["severity"], "high");
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn test_execution_failure_from_error() {
        let err = TerminalError::ConcurrencyExceeded { limit: 1 };
        let result = ExecutionResult::failed("", &err);
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::ConcurrencyExceeded));
    }
}
