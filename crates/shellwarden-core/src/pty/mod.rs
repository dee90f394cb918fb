//! PTY Module - shell sessions behind pseudo-terminals
//!
//! # Components
//! - `PTYSession`: one shell process and its typed event channel
//! - `PTYManager`: owns every live session by id

mod manager;
mod session;

pub use manager::PTYManager;
pub use session::{generate_session_id, PTYSession, PTYSessionOptions, SessionEvent};
