//! Command Executor - validation gate plus resource-governed sandbox dispatch
//!
//! Per execution: `validating -> {rejected | resource_limited |
//! concurrency_limited | dispatched} -> running -> {completed | timed_out |
//! errored}`. Nothing is retried.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shellwarden_runner::{sandbox_env, RunOptions, SandboxRunner};
use tracing::{debug, error, info, warn};

use super::resources::{self, CpuSampler};
use super::validator::CommandValidator;
use crate::config::ExecutorConfig;
use crate::error::{RejectionReason, Result, TerminalError};
use crate::types::{
    ExecutionFailure, ExecutionResult, FailureKind, LimitKey, ResourceLimits, ResourceUsage,
    SecurityEvent, SecurityEventType, Severity,
};

/// Step of a single execution, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Validating,
    Rejected,
    ResourceLimited,
    ConcurrencyLimited,
    Dispatched,
    Running,
    Completed,
    TimedOut,
    Errored,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Validating => "validating",
            ExecutionPhase::Rejected => "rejected",
            ExecutionPhase::ResourceLimited => "resource_limited",
            ExecutionPhase::ConcurrencyLimited => "concurrency_limited",
            ExecutionPhase::Dispatched => "dispatched",
            ExecutionPhase::Running => "running",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::TimedOut => "timed_out",
            ExecutionPhase::Errored => "errored",
        }
    }

    /// Whether the execution ends in this phase
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Rejected
                | ExecutionPhase::ResourceLimited
                | ExecutionPhase::ConcurrencyLimited
                | ExecutionPhase::Completed
                | ExecutionPhase::TimedOut
                | ExecutionPhase::Errored
        )
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds one slot of the global worker ceiling until dropped
struct WorkerSlot<'a> {
    active: &'a AtomicUsize,
}

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Validates commands and runs them in sandbox workers
///
/// All methods take `&self`; share it behind an `Arc`.
pub struct CommandExecutor {
    validator: RwLock<CommandValidator>,
    limits: RwLock<ResourceLimits>,
    usage: Mutex<ResourceUsage>,
    sampler: Mutex<CpuSampler>,
    events: Mutex<VecDeque<SecurityEvent>>,
    max_security_events: usize,

    active_workers: AtomicUsize,
    max_concurrent_workers: AtomicUsize,
    throttle_threshold: f64,
    cooldown_until: Mutex<Option<Instant>>,

    work_dir: PathBuf,
    kill_grace: Duration,
    lifetime_grace: Duration,
    runner: SandboxRunner,
    next_execution_id: AtomicU64,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let work_dir = config.resolve_work_dir();
        Self {
            validator: RwLock::new(CommandValidator::new(&config.blocked_commands)),
            limits: RwLock::new(config.limits),
            usage: Mutex::new(ResourceUsage::default()),
            sampler: Mutex::new(CpuSampler::new()),
            events: Mutex::new(VecDeque::new()),
            max_security_events: config.max_security_events.max(1),
            active_workers: AtomicUsize::new(0),
            max_concurrent_workers: AtomicUsize::new(config.max_concurrent_workers.max(1)),
            throttle_threshold: config.throttle_threshold,
            cooldown_until: Mutex::new(None),
            work_dir,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            lifetime_grace: Duration::from_millis(config.lifetime_grace_ms),
            runner: SandboxRunner::new(),
            next_execution_id: AtomicU64::new(1),
        }
    }

    // ========== Validation ==========

    /// Pure validity query: no event is logged
    pub fn validate_command(&self, command: &str) -> bool {
        self.check_command(command).is_ok()
    }

    /// Validate and report why a command is rejected
    pub fn check_command(&self, command: &str) -> Result<()> {
        read(&self.validator).check(command)
    }

    /// Validate, logging a security event on rejection
    pub fn screen_command(&self, command: &str) -> Result<()> {
        let result = self.check_command(command);
        if let Err(TerminalError::ValidationRejected { reason, detail }) = &result {
            let event_type = match reason {
                RejectionReason::PathTraversal => SecurityEventType::AccessDenied,
                _ => SecurityEventType::CommandBlocked,
            };
            warn!(command = %command, reason = %reason, detail = %detail, "Command rejected");
            self.log_security_event(
                event_type,
                Severity::High,
                format!("{} ({}: {})", command.trim(), reason, detail),
            );
        }
        result
    }

    pub fn add_blocked_command(&self, command: &str) -> bool {
        let added = write(&self.validator).block(command);
        if added {
            info!(command = %command, "Blocked command added");
        }
        added
    }

    pub fn remove_blocked_command(&self, command: &str) -> bool {
        let removed = write(&self.validator).unblock(command);
        if removed {
            info!(command = %command, "Blocked command removed");
        }
        removed
    }

    /// Whether the blocked set alone rejects this command
    pub fn is_command_blocked(&self, command: &str) -> bool {
        read(&self.validator).is_blocked(command)
    }

    pub fn blocked_commands(&self) -> Vec<String> {
        read(&self.validator).blocked_commands()
    }

    // ========== Execution ==========

    /// Run one command through the full pipeline
    ///
    /// Blocks up to the configured timeout. Failures come back as an
    /// unsuccessful [`ExecutionResult`], never as a panic or dropped call.
    pub async fn execute_command(&self, command: &str) -> ExecutionResult {
        let exec_id = self.next_execution_id.fetch_add(1, Ordering::Relaxed);
        phase(exec_id, ExecutionPhase::Validating);

        if let Err(e) = self.screen_command(command) {
            phase(exec_id, ExecutionPhase::Rejected);
            return ExecutionResult::failed(e.to_string(), &e);
        }

        if let Err(e) = self.check_resources() {
            phase(exec_id, ExecutionPhase::ResourceLimited);
            warn!(exec_id, error = %e, "Execution refused: resource limit");
            self.log_security_event(SecurityEventType::ResourceExceeded, Severity::Medium, e.to_string());
            return ExecutionResult::failed(e.to_string(), &e);
        }

        let slot = match self.acquire_worker() {
            Ok(slot) => slot,
            Err(e) => {
                phase(exec_id, ExecutionPhase::ConcurrencyLimited);
                warn!(exec_id, error = %e, "Execution refused: worker ceiling reached");
                self.log_security_event(SecurityEventType::ResourceExceeded, Severity::Medium, e.to_string());
                return ExecutionResult::failed(e.to_string(), &e);
            }
        };

        let limits = self.get_resource_limits();
        let timeout = Duration::from_millis(limits.max_execution_time_ms);
        let options = RunOptions {
            command: command.trim().to_string(),
            cwd: self.work_dir.clone(),
            timeout,
            max_output: limits.max_output,
            kill_grace: self.kill_grace,
            max_lifetime: timeout + self.lifetime_grace,
            env: sandbox_env(),
        };

        phase(exec_id, ExecutionPhase::Dispatched);
        let started = Instant::now();
        phase(exec_id, ExecutionPhase::Running);
        let outcome = self.runner.run(options).await;
        let elapsed = started.elapsed();
        drop(slot);

        let result = match outcome {
            Ok(outcome) if outcome.timed_out || elapsed > timeout => {
                phase(exec_id, ExecutionPhase::TimedOut);
                let err = TerminalError::ExecutionTimeout {
                    limit_ms: limits.max_execution_time_ms,
                };
                ExecutionResult::failed(outcome.output, &err)
            }
            Ok(outcome) if outcome.exited_cleanly() => {
                phase(exec_id, ExecutionPhase::Completed);
                ExecutionResult {
                    success: true,
                    output: outcome.output,
                    error: None,
                }
            }
            Ok(outcome) => {
                phase(exec_id, ExecutionPhase::Errored);
                let message = match outcome.exit_code {
                    Some(code) => format!("Command exited with status {}", code),
                    None => "Command terminated by signal".to_string(),
                };
                ExecutionResult {
                    success: false,
                    output: outcome.output,
                    error: Some(ExecutionFailure {
                        kind: FailureKind::ExecutionFailed,
                        message,
                    }),
                }
            }
            Err(e) => {
                phase(exec_id, ExecutionPhase::Errored);
                error!(exec_id, error = %e, "Sandbox worker failed");
                ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some(ExecutionFailure {
                        kind: FailureKind::ExecutionFailed,
                        message: e.to_string(),
                    }),
                }
            }
        };

        info!(
            exec_id,
            success = result.success,
            output_len = result.output.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Execution finished"
        );

        self.refresh_usage();
        result
    }

    /// Log a failure surfaced by a caller
    pub fn handle_error(&self, err: &TerminalError) {
        if err.is_session_fatal() {
            error!(error = %err, "Terminal operation failed");
        } else {
            warn!(error = %err, "Command refused");
        }
    }

    // ========== Resources ==========

    /// Change one limit at runtime
    pub fn set_resource_limit(&self, key: LimitKey, value: f64) -> Result<()> {
        write(&self.limits).set(key, value)?;
        info!(limit = %key, value, "Resource limit updated");
        Ok(())
    }

    pub fn get_resource_limits(&self) -> ResourceLimits {
        read(&self.limits).clone()
    }

    pub fn get_resource_usage(&self) -> ResourceUsage {
        lock(&self.usage).clone()
    }

    pub fn set_max_concurrent_workers(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(TerminalError::InvalidConfig(
                "maxConcurrentWorkers must be at least 1".to_string(),
            ));
        }
        self.max_concurrent_workers.store(n, Ordering::SeqCst);
        info!(max_concurrent_workers = n, "Worker ceiling updated");
        Ok(())
    }

    pub fn max_concurrent_workers(&self) -> usize {
        self.max_concurrent_workers.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Time left in the current CPU cooldown window, if any
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = (*lock(&self.cooldown_until))?;
        until.checked_duration_since(Instant::now())
    }

    /// Logged security events, oldest first
    pub fn get_security_events(&self) -> Vec<SecurityEvent> {
        lock(&self.events).iter().cloned().collect()
    }

    fn check_resources(&self) -> Result<()> {
        let limits = self.get_resource_limits();
        let usage = self.get_resource_usage();
        let active = self.active_workers() as u32;

        let readings = [
            ("cpu", usage.cpu_usage, limits.max_cpu_usage),
            ("memory", usage.memory_usage as f64, limits.max_memory_usage as f64),
            (
                "file_descriptors",
                (active * 3) as f64,
                limits.max_file_descriptors as f64,
            ),
            (
                "network_connections",
                active as f64,
                limits.max_network_connections as f64,
            ),
        ];

        for (resource, actual, limit) in readings {
            if actual >= limit {
                return Err(TerminalError::ResourceExceeded {
                    resource: resource.to_string(),
                    actual,
                    limit,
                });
            }
        }
        Ok(())
    }

    fn acquire_worker(&self) -> Result<WorkerSlot<'_>> {
        let limit = self.max_concurrent_workers();
        self.active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| WorkerSlot {
                active: &self.active_workers,
            })
            .map_err(|_| TerminalError::ConcurrencyExceeded { limit })
    }

    /// Resample usage after an execution and start a cooldown when hot
    fn refresh_usage(&self) {
        let sample = lock(&self.sampler).sample();
        let active = self.active_workers() as u32;

        let cpu = {
            let mut usage = lock(&self.usage);
            usage.cpu_usage = resources::smooth(usage.cpu_usage, sample);
            usage.memory_usage = resources::memory_usage_bytes();
            usage.file_descriptors = active * 3;
            usage.network_connections = active;
            usage.cpu_usage
        };
        debug!(cpu_sample = sample, cpu_smoothed = cpu, "Resource usage refreshed");

        if let Some(window) = resources::cooldown_for(cpu, self.throttle_threshold) {
            let mut until = lock(&self.cooldown_until);
            let now = Instant::now();
            if until.map_or(true, |t| t <= now) {
                *until = Some(now + window);
                drop(until);
                warn!(
                    cpu = cpu,
                    threshold = self.throttle_threshold,
                    cooldown_ms = window.as_millis() as u64,
                    "CPU above throttle threshold, cooldown started"
                );
                self.log_security_event(
                    SecurityEventType::ResourceExceeded,
                    Severity::Low,
                    format!(
                        "CPU {:.1}% above throttle threshold {:.1}%, cooldown {}ms",
                        cpu,
                        self.throttle_threshold,
                        window.as_millis()
                    ),
                );
            }
        }
    }

    fn log_security_event(&self, event_type: SecurityEventType, severity: Severity, details: String) {
        let event = SecurityEvent {
            event_type,
            timestamp: Utc::now().timestamp_millis(),
            details,
            severity,
        };
        let mut events = lock(&self.events);
        while events.len() >= self.max_security_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

fn phase(exec_id: u64, phase: ExecutionPhase) {
    debug!(exec_id, phase = %phase, "Execution phase");
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
