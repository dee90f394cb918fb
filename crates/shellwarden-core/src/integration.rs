//! Terminal Integration - the facade the approval front end talks to
//!
//! Each session gets its own OutputProcessor and StateManager. A pump task
//! moves raw PTY output through the processor, records the redacted text in
//! state and rebroadcasts it to output subscribers. When the shell exits or
//! its PTY fails, the pump drops the session's context as well.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TerminalConfig;
use crate::error::{Result, TerminalError};
use crate::exec::CommandExecutor;
use crate::output::{OutputMetrics, OutputProcessor};
use crate::pty::{PTYManager, SessionEvent};
use crate::state::StateManager;
use crate::types::{ExecutionResult, StateChange, StatePatch, TerminalState};

const OUTPUT_CHANNEL_CAPACITY: usize = 1000;

type ContextTable = Arc<RwLock<HashMap<String, SessionEntry>>>;

/// Processing state owned by one session
struct SessionContext {
    output: Mutex<OutputProcessor>,
    state: Mutex<StateManager>,
    output_tx: broadcast::Sender<String>,
}

impl SessionContext {
    fn output(&self) -> MutexGuard<'_, OutputProcessor> {
        self.output.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, StateManager> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Process one raw chunk and fan the redacted text out
    fn ingest(&self, data: &[u8]) {
        let text = self.output().process_raw_output(data);
        if text.is_empty() {
            return;
        }
        self.state().update_state(StatePatch::commands([text.clone()]));
        // No subscribers is fine
        let _ = self.output_tx.send(text);
    }

    /// Record a forwarded command in the same redacted form the output shows
    fn record_command(&self, command: &str) -> String {
        let recorded = self.output().filter_sensitive_data(command);
        self.state()
            .update_state(StatePatch::commands([recorded.clone()]));
        recorded
    }
}

struct SessionEntry {
    context: Arc<SessionContext>,
    pump: JoinHandle<()>,
}

pub struct TerminalIntegration {
    pty: PTYManager,
    executor: Arc<CommandExecutor>,
    sessions: ContextTable,
    config: TerminalConfig,
}

impl Default for TerminalIntegration {
    fn default() -> Self {
        Self::new(TerminalConfig::default())
    }
}

impl TerminalIntegration {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            pty: PTYManager::new(config.pty.clone()),
            executor: Arc::new(CommandExecutor::new(config.executor.clone())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    // ========== Lifecycle ==========

    /// Open a session and start processing its output. Returns the session id.
    pub async fn initialize(&self) -> Result<String> {
        let (session, events) = self
            .pty
            .create_session_with_events(self.config.pty.cols, self.config.pty.rows)
            .await?;

        let cwd = self.pty.config().resolve_cwd();
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let context = Arc::new(SessionContext {
            output: Mutex::new(OutputProcessor::new(self.config.output.clone())),
            state: Mutex::new(StateManager::new(
                cwd.to_string_lossy(),
                session.pid,
                self.config.state.clone(),
            )),
            output_tx,
        });

        // Hold the table until the entry is in, so a shell that exits at once
        // cannot be torn down before it is registered
        let mut sessions = self.sessions.write().await;
        let pump = tokio::spawn(pump_output(
            session.id.clone(),
            events,
            Arc::clone(&context),
            Arc::clone(&self.sessions),
        ));
        sessions.insert(session.id.clone(), SessionEntry { context, pump });
        drop(sessions);

        info!(session_id = %session.id, pid = session.pid, "Terminal session initialized");
        Ok(session.id)
    }

    /// Forward an approved command to the session's shell
    ///
    /// Validation runs first. A rejected command never reaches the PTY.
    pub async fn execute_command(&self, session_id: &str, command: &str) -> Result<()> {
        if let Err(e) = self.executor.screen_command(command) {
            self.executor.handle_error(&e);
            return Err(e);
        }

        let context = self.context(session_id).await?;

        if let Err(e) = self
            .pty
            .send_input(session_id, format!("{}\n", command).as_bytes())
            .await
        {
            self.executor.handle_error(&e);
            return Err(e);
        }

        let recorded = context.record_command(command);
        debug!(session_id = %session_id, command = %recorded, "Command forwarded");
        Ok(())
    }

    /// Run a command in a sandbox worker, independent of any session
    pub async fn run_isolated(&self, command: &str) -> ExecutionResult {
        self.executor.execute_command(command).await
    }

    /// Close the PTY and drop the session's buffer and history
    pub async fn cleanup(&self, session_id: &str) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| TerminalError::SessionNotFound(session_id.to_string()))?;

        self.pty.close_session(session_id).await;
        entry.pump.abort();
        entry.context.output().clear_buffer();
        entry.context.state().clear_history();

        info!(session_id = %session_id, "Terminal session cleaned up");
        Ok(())
    }

    /// Clean up every session, then the PTY manager
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.cleanup(&id).await {
                warn!(session_id = %id, error = %e, "Cleanup failed during shutdown");
            }
        }
        self.pty.cleanup().await;
    }

    // ========== Session I/O ==========

    /// Receiver of redacted output text
    pub async fn subscribe_output(&self, session_id: &str) -> Result<broadcast::Receiver<String>> {
        Ok(self.context(session_id).await?.output_tx.subscribe())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.pty.resize_session(session_id, cols, rows).await
    }

    pub async fn get_formatted_output(&self, session_id: &str) -> Result<String> {
        Ok(self.context(session_id).await?.output().get_formatted_output())
    }

    pub async fn get_output_metrics(&self, session_id: &str) -> Result<OutputMetrics> {
        Ok(self.context(session_id).await?.output().get_metrics())
    }

    // ========== State ==========

    pub async fn get_terminal_state(&self, session_id: &str) -> Result<TerminalState> {
        Ok(self.context(session_id).await?.state().get_snapshot())
    }

    pub async fn get_command_history(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self.context(session_id).await?.state().get_command_history())
    }

    pub async fn get_current_directory(&self, session_id: &str) -> Result<String> {
        Ok(self
            .context(session_id)
            .await?
            .state()
            .get_current_working_directory())
    }

    pub async fn get_state_history(&self, session_id: &str) -> Result<Vec<StateChange>> {
        Ok(self.context(session_id).await?.state().get_state_history())
    }

    // ========== Components ==========

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn pty(&self) -> &PTYManager {
        &self.pty
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn context(&self, session_id: &str) -> Result<Arc<SessionContext>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| Arc::clone(&entry.context))
            .ok_or_else(|| TerminalError::SessionNotFound(session_id.to_string()))
    }
}

async fn pump_output(
    session_id: String,
    mut events: broadcast::Receiver<SessionEvent>,
    context: Arc<SessionContext>,
    sessions: ContextTable,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Data(data)) => context.ingest(&data),
            Ok(SessionEvent::Exit(code)) => {
                info!(session_id = %session_id, exit_code = code, "Session output ended");
                break;
            }
            Ok(SessionEvent::Error(message)) => {
                warn!(session_id = %session_id, error = %message, "Session output failed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(session_id = %session_id, skipped = n, "Output pump lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    // The PTY side is gone; the manager has already dropped it
    if sessions.write().await.remove(&session_id).is_some() {
        info!(session_id = %session_id, "Terminal session torn down");
    }
}
