//! Command execution - validation, resource governance, sandbox dispatch

mod executor;
pub mod resources;
mod validator;

pub use executor::{CommandExecutor, ExecutionPhase};
pub use validator::CommandValidator;
