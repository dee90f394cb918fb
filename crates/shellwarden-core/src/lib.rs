//! shellwarden-core - gated terminal sessions
//!
//! - `pty`: pseudo-terminal sessions and the id-indexed session table
//! - `exec`: command validation, resource checks and the sandbox worker pool
//! - `output`: decoding, secret redaction and the bounded output buffer
//! - `state`: per-session canonical state with a diff-based audit log
//! - `integration`: the facade tying one session to its output and state
//!
//! # Example
//!
//! ```no_run
//! use shellwarden_core::{TerminalConfig, TerminalIntegration};
//!
//! #[tokio::main]
//! async fn main() -> shellwarden_core::Result<()> {
//!     let terminal = TerminalIntegration::new(TerminalConfig::default());
//!     let id = terminal.initialize().await?;
//!     let mut output = terminal.subscribe_output(&id).await?;
//!
//!     terminal.execute_command(&id, "ls -la").await?;
//!     if let Ok(text) = output.recv().await {
//!         print!("{}", text);
//!     }
//!
//!     terminal.cleanup(&id).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod exec;
pub mod integration;
pub mod output;
pub mod pty;
pub mod state;
pub mod types;

pub use config::TerminalConfig;
pub use error::{RejectionReason, Result, TerminalError};
pub use exec::{CommandExecutor, CommandValidator, ExecutionPhase};
pub use integration::TerminalIntegration;
pub use output::{OutputMetrics, OutputProcessor};
pub use pty::{PTYManager, PTYSession, SessionEvent};
pub use state::StateManager;
pub use types::*;
