//! shellwarden-runner - sandboxed single-command worker
//!
//! Runs one command as a plain argv vector (no shell, no script body) under a
//! minimized environment, a fixed working directory, a hard timeout, an output
//! cap and an unconditional maximum lifetime.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use shellwarden_runner::{RunOptions, SandboxRunner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), shellwarden_runner::RunnerError> {
//!     let runner = SandboxRunner::new();
//!
//!     let outcome = runner.run(RunOptions {
//!         command: "ls -la".to_string(),
//!         timeout: Duration::from_secs(5),
//!         ..Default::default()
//!     }).await?;
//!
//!     println!("{}", outcome.output);
//!     Ok(())
//! }
//! ```

pub mod process_group;
mod runner;
mod types;

pub use runner::{parse_command, truncate_utf8, SandboxRunner};
pub use types::*;
