//! shellwarden - gated terminal front end
//!
//! Subcommands:
//! - `shell`: open a PTY session; each stdin line is approved text for the session
//! - `run <command>`: run one command in the sandbox and print the result as JSON
//! - `check <command>`: report whether a command passes validation

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shellwarden_core::config::{default_config_path, default_home};
use shellwarden_core::{
    CommandExecutor, SessionEvent, TerminalConfig, TerminalError, TerminalIntegration,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How long to keep flushing output after the shell exits
const EXIT_DRAIN: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "shellwarden")]
#[command(about = "Run approved commands in a guarded terminal session")]
#[command(version)]
struct Args {
    /// Config file (defaults to $SHELLWARDEN_CONFIG or ~/.shellwarden/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open an interactive session fed from stdin
    Shell,
    /// Run one command in an isolated worker
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Validate a command without running it
    Check {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("SHELLWARDEN_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn init_logging(home: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    // stderr + file (daily rotation)
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "shellwarden.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "SHELLWARDEN PANIC: {}", payload);
    }));

    guard
}

/// Rebuild command text from argv, quoting words so the runner splits it back
/// into the same arguments
fn command_text(words: &[String]) -> String {
    shell_words::join(words)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let home = default_home();
    std::fs::create_dir_all(&home).ok();
    let _guard = init_logging(&home);

    let config_path = args.config.unwrap_or_else(default_config_path);
    let config = TerminalConfig::load(&config_path);
    debug!(path = %config_path.display(), "Config loaded");

    match args.command {
        Command::Shell => run_shell(config).await.map(|()| ExitCode::SUCCESS),
        Command::Run { command } => run_once(config, &command_text(&command)).await,
        Command::Check { command } => {
            check(&CommandExecutor::new(config.executor), &command_text(&command));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn check(executor: &CommandExecutor, command: &str) {
    match executor.check_command(command) {
        Ok(()) => println!("allowed: {}", command),
        Err(e) => println!("rejected: {}", e),
    }
}

async fn run_once(config: TerminalConfig, command: &str) -> Result<ExitCode> {
    let executor = CommandExecutor::new(config.executor);
    let result = executor.execute_command(command).await;

    let json = serde_json::to_string_pretty(&result).context("Failed to encode result")?;
    println!("{}", json);

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_shell(config: TerminalConfig) -> Result<()> {
    let terminal = TerminalIntegration::new(config);
    let id = terminal
        .initialize()
        .await
        .context("Failed to open terminal session")?;
    let mut output = terminal.subscribe_output(&id).await?;
    let mut events = terminal.pty().subscribe(&id).await?;
    info!(session_id = %id, "Shell ready");

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        loop {
            match output.recv().await {
                Ok(text) => {
                    let _ = stdout.write_all(text.as_bytes());
                    let _ = stdout.flush();
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Output printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        if let Err(e) = terminal.execute_command(&id, &line).await {
                            eprintln!("rejected: {}", e);
                            if e.is_session_fatal() || matches!(e, TerminalError::SessionNotFound(_)) {
                                break;
                            }
                        }
                    }
                    None => {
                        debug!(session_id = %id, "stdin closed");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::Exit(code)) => {
                        info!(session_id = %id, exit_code = code, "Shell exited");
                        break;
                    }
                    Ok(SessionEvent::Error(message)) => {
                        warn!(session_id = %id, error = %message, "Shell failed");
                        break;
                    }
                    Ok(SessionEvent::Data(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    tokio::time::sleep(EXIT_DRAIN).await;
    terminal.shutdown().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_text_keeps_arguments() {
        let argv = words(&["grep", "-n", "two words", "notes.txt"]);
        let text = command_text(&argv);
        assert_eq!(shell_words::split(&text).unwrap(), argv);

        assert_eq!(command_text(&words(&["ls", "-la"])), "ls -la");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["shellwarden", "run", "ls", "-la"]).unwrap();
        assert!(matches!(args.command, Command::Run { ref command } if command == &words(&["ls", "-la"])));

        let args =
            Args::try_parse_from(["shellwarden", "--config", "/tmp/c.yaml", "check", "ls"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert!(Args::try_parse_from(["shellwarden", "run"]).is_err());
    }
}
