//! Sandbox runner implementation
//!
//! The entry point is fixed: the command text is split into argv and the first
//! word is executed directly. Nothing is ever interpolated into a script.

use crate::process_group::{self, KillSignal};
use crate::types::*;
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Sandboxed command runner
///
/// Each call to [`SandboxRunner::run`] spawns exactly one worker process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxRunner;

impl SandboxRunner {
    /// Create a new runner
    pub fn new() -> Self {
        Self
    }

    /// Run one command to completion, timeout or lifetime expiry
    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome, RunnerError> {
        let RunOptions {
            command,
            cwd,
            timeout,
            max_output,
            kill_grace,
            max_lifetime,
            env,
        } = options;

        let argv = parse_command(&command)?;
        let (program, args) = argv.split_first().ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(?argv, cwd = %cwd.display(), "Starting sandbox worker");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        // Lifetime reaper: fires even if the worker already finished
        if let Some(pid) = pid {
            tokio::spawn(async move {
                tokio::time::sleep(max_lifetime).await;
                match process_group::kill_process_group(pid, KillSignal::Kill) {
                    Ok(()) => debug!(pid, "Worker lifetime expired"),
                    Err(e) => warn!(pid, error = %e, "Failed to reap worker group"),
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("worker stderr not captured"))?;

        let stdout_handle = tokio::spawn(capture(stdout, max_output));
        let stderr_handle = tokio::spawn(capture(stderr, max_output));

        let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (Some(status?), false),
            Err(_) => {
                warn!(?pid, timeout_ms = timeout.as_millis() as u64, "Worker timed out");
                (terminate(&mut child, pid, kill_grace).await, true)
            }
        };

        // A forked grandchild may hold the pipes open past the worker's exit
        let (out, out_truncated) = join_capture(stdout_handle, kill_grace, pid).await;
        let (err, err_truncated) = join_capture(stderr_handle, kill_grace, pid).await;

        let mut combined = out;
        combined.extend_from_slice(&err);
        let mut output = String::from_utf8_lossy(&combined).into_owned();
        let cut = truncate_utf8(&mut output, max_output);

        let outcome = RunOutcome {
            output,
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            truncated: cut || out_truncated || err_truncated,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        debug!(
            ?pid,
            exit_code = ?outcome.exit_code,
            timed_out,
            output_len = outcome.output.len(),
            duration_ms = outcome.duration_ms,
            "Sandbox worker finished"
        );

        Ok(outcome)
    }
}

/// Split command text into argv using POSIX word rules
pub fn parse_command(command: &str) -> Result<Vec<String>, RunnerError> {
    let argv = shell_words::split(command).map_err(|e| RunnerError::Parse(e.to_string()))?;
    if argv.is_empty() {
        return Err(RunnerError::EmptyCommand);
    }
    Ok(argv)
}

/// Truncate to at most `max_bytes`, backing off to a char boundary.
/// Returns true if anything was removed.
pub fn truncate_utf8(text: &mut String, max_bytes: usize) -> bool {
    if text.len() <= max_bytes {
        return false;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    true
}

/// SIGTERM the worker group, then SIGKILL after the grace period
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> Option<std::process::ExitStatus> {
    if let Some(pid) = pid {
        if let Err(e) = process_group::kill_process_group(pid, KillSignal::Term) {
            warn!(pid, error = %e, "Failed to send SIGTERM to worker group");
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status.ok();
    }

    if let Some(pid) = pid {
        if let Err(e) = process_group::kill_process_group(pid, KillSignal::Kill) {
            warn!(pid, error = %e, "Failed to send SIGKILL to worker group");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Worker already gone");
    }
    child.wait().await.ok()
}

/// Read a stream to EOF, keeping at most `limit` bytes
async fn capture<R>(mut reader: R, limit: usize) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }

    Ok((kept, truncated))
}

async fn join_capture(
    handle: tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    grace: Duration,
    pid: Option<u32>,
) -> (Vec<u8>, bool) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Worker output read failed");
            (Vec::new(), false)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Worker output task failed");
            (Vec::new(), false)
        }
        Err(_) => {
            if let Some(pid) = pid {
                let _ = process_group::kill_process_group(pid, KillSignal::Kill);
            }
            abort.abort();
            warn!(?pid, "Worker output still open after exit, group killed");
            (Vec::new(), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(command: &str) -> RunOptions {
        RunOptions {
            command: command.to_string(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("ls -la").unwrap(), vec!["ls", "-la"]);
        assert_eq!(
            parse_command("echo \"hello world\"").unwrap(),
            vec!["echo", "hello world"]
        );
        assert!(matches!(parse_command("   "), Err(RunnerError::EmptyCommand)));
        assert!(matches!(
            parse_command("echo 'unterminated"),
            Err(RunnerError::Parse(_))
        ));
    }

    #[test]
    fn test_truncate_utf8() {
        let mut s = "héllo".to_string();
        // 'é' is two bytes: cutting at 2 would split it
        assert!(truncate_utf8(&mut s, 2));
        assert_eq!(s, "h");

        let mut s = "short".to_string();
        assert!(!truncate_utf8(&mut s, 100));
        assert_eq!(s, "short");
    }

    #[test]
    fn test_sandbox_env_is_minimal() {
        let env = sandbox_env();
        assert!(env.iter().all(|(k, _)| PROPAGATED_ENV.contains(&k.as_str())));
        assert!(env.iter().any(|(k, _)| k == "PATH"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_echo() {
        let outcome = SandboxRunner::new().run(options("echo hello")).await.unwrap();
        assert_eq!(outcome.output, "hello\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.exited_cleanly());
        assert!(!outcome.truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_metacharacters_are_not_interpreted() {
        // No shell: the semicolon is just part of an argument
        let outcome = SandboxRunner::new()
            .run(options("echo a;b"))
            .await
            .unwrap();
        assert_eq!(outcome.output, "a;b\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_is_cleared() {
        let mut opts = options("env");
        opts.env = vec![
            ("PATH".to_string(), FALLBACK_PATH.to_string()),
            ("TERM".to_string(), "dumb".to_string()),
        ];
        let outcome = SandboxRunner::new().run(opts).await.unwrap();

        let mut keys: Vec<&str> = outcome
            .output
            .lines()
            .filter_map(|l| l.split('=').next())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["PATH", "TERM"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fixed_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().canonicalize().unwrap();
        let mut opts = options("pwd");
        opts.cwd = expected.clone();

        let outcome = SandboxRunner::new().run(opts).await.unwrap();
        assert_eq!(outcome.output.trim(), expected.to_string_lossy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_terminates_worker() {
        let mut opts = options("sleep 10");
        opts.timeout = Duration::from_millis(200);

        let started = Instant::now();
        let outcome = SandboxRunner::new().run(opts).await.unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.exited_cleanly());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Running (not reaped or zombie) according to /proc
    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // Field 3, after the parenthesized command name
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z" && state != "X")
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_lifetime_reaper_kills_detached_grandchild() {
        let mut opts = options("sh -c 'sleep 30 >/dev/null 2>&1 & echo $!'");
        opts.max_lifetime = Duration::from_secs(1);

        let outcome = SandboxRunner::new().run(opts).await.unwrap();
        assert!(outcome.exited_cleanly());
        let grandchild: u32 = outcome.output.trim().parse().unwrap();

        // The worker returned, but its background job lives on in the group
        assert!(is_alive(grandchild));

        let deadline = Instant::now() + Duration::from_secs(5);
        while is_alive(grandchild) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!is_alive(grandchild), "worker group outlived its maximum lifetime");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_cap() {
        let mut opts = options("yes");
        opts.timeout = Duration::from_millis(300);
        opts.max_output = 100;

        let outcome = SandboxRunner::new().run(opts).await.unwrap();
        assert!(outcome.output.len() <= 100);
        assert!(outcome.truncated);
        assert!(outcome.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_is_combined() {
        let outcome = SandboxRunner::new()
            .run(options("ls /definitely-not-a-real-path-for-tests"))
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, Some(0));
        assert!(!outcome.output.is_empty());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = SandboxRunner::new()
            .run(options("definitely-not-a-real-program-for-tests"))
            .await;
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }
}
