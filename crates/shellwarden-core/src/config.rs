//! Configuration - YAML file with per-field defaults
//!
//! Location: `$SHELLWARDEN_CONFIG`, else `$SHELLWARDEN_HOME/config.yaml`,
//! else `~/.shellwarden/config.yaml`. A missing or unreadable file yields
//! the defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::types::ResourceLimits;

/// Blocked-command entries used when none are configured
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "> /dev/sda",
    "mkfs",
    "dd",
    ":(){ :|:& };:",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalConfig {
    pub pty: PtyConfig,
    pub executor: ExecutorConfig,
    pub output: OutputConfig,
    pub state: StateConfig,
}

/// PTY session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PtyConfig {
    /// Shell program; falls back to `$SHELL`, then the platform default
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Starting directory; falls back to the process cwd
    pub cwd: Option<PathBuf>,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 80,
            rows: 24,
            cwd: None,
        }
    }
}

impl PtyConfig {
    /// Resolve the shell to spawn
    pub fn resolve_shell(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            return "powershell.exe".to_string();
        }
        std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
    }

    /// Resolve the starting directory
    pub fn resolve_cwd(&self) -> PathBuf {
        self.cwd.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
        })
    }
}

/// Command executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub limits: ResourceLimits,
    /// Global ceiling on concurrently running sandbox workers
    pub max_concurrent_workers: usize,
    pub blocked_commands: Vec<String>,
    /// Smoothed CPU percent above which a cooldown window starts
    pub throttle_threshold: f64,
    /// Fixed working directory for sandbox workers
    pub work_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL on timeout, milliseconds
    pub kill_grace_ms: u64,
    /// Worker lifetime beyond the execution timeout, milliseconds
    pub lifetime_grace_ms: u64,
    pub max_security_events: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            max_concurrent_workers: 1,
            blocked_commands: DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            throttle_threshold: 70.0,
            work_dir: None,
            kill_grace_ms: 500,
            lifetime_grace_ms: 2_000,
            max_security_events: 10_000,
        }
    }
}

impl ExecutorConfig {
    pub fn resolve_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Output buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_records: 1000,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Session state settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateConfig {
    pub max_history_size: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_history_size: 1000,
        }
    }
}

impl TerminalConfig {
    /// Load from YAML file, returns defaults if the file doesn't exist or is invalid
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = ?path, "No config found, using defaults");
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => {
                    info!(path = ?path, "Config loaded");
                    config
                }
                Err(e) => {
                    error!(error = %e, path = ?path, "Failed to parse config");
                    Self::default()
                }
            },
            Err(e) => {
                error!(error = %e, path = ?path, "Failed to read config");
                Self::default()
            }
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        info!(path = ?path, "Config saved");
        Ok(())
    }
}

/// Data directory: `$SHELLWARDEN_HOME`, else `~/.shellwarden`
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("SHELLWARDEN_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".shellwarden"))
        .unwrap_or_else(|| PathBuf::from(".shellwarden"))
}

/// Config file path: `$SHELLWARDEN_CONFIG`, else `<home>/config.yaml`
pub fn default_config_path() -> PathBuf {
    std::env::var("SHELLWARDEN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_home().join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = TerminalConfig::load(&dir.path().join("nope.yaml"));
        assert_eq!(config, TerminalConfig::default());
        assert_eq!(config.executor.max_concurrent_workers, 1);
        assert!(config.executor.blocked_commands.contains(&"mkfs".to_string()));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "executor:\n  maxConcurrentWorkers: 4\n  limits:\n    maxExecutionTime: 1500\noutput:\n  maxRecords: 10\n",
        )
        .unwrap();

        let config = TerminalConfig::load(&path);
        assert_eq!(config.executor.max_concurrent_workers, 4);
        assert_eq!(config.executor.limits.max_execution_time_ms, 1500);
        assert_eq!(config.executor.limits.max_output, 1024 * 1024);
        assert_eq!(config.output.max_records, 10);
        assert_eq!(config.output.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.state.max_history_size, 1000);
    }

    #[test]
    fn test_invalid_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "executor: [not, a, map").unwrap();
        assert_eq!(TerminalConfig::load(&path), TerminalConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = TerminalConfig::default();
        config.pty.shell = Some("/bin/sh".to_string());
        config.state.max_history_size = 5;
        config.save(&path).unwrap();

        assert_eq!(TerminalConfig::load(&path), config);
    }
}
