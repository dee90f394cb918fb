//! PTY Manager - owns every live shell session by id
//!
//! Sessions are torn down when the shell exits or the read side fails; the
//! watcher task spawned per session removes it from the table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::session::{generate_session_id, PTYSession, PTYSessionOptions, SessionEvent};
use crate::config::PtyConfig;
use crate::error::{Result, TerminalError};
use crate::types::Session;

type SessionTable = Arc<RwLock<HashMap<String, Arc<PTYSession>>>>;

/// Manager for multiple PTY sessions
pub struct PTYManager {
    /// Active sessions by id
    sessions: SessionTable,
    config: PtyConfig,
}

impl Default for PTYManager {
    fn default() -> Self {
        Self::new(PtyConfig::default())
    }
}

impl PTYManager {
    pub fn new(config: PtyConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &PtyConfig {
        &self.config
    }

    /// Spawn a shell under a new pseudo-terminal
    pub async fn create_session(&self, cols: u16, rows: u16) -> Result<Session> {
        self.create_session_with_events(cols, rows)
            .await
            .map(|(session, _)| session)
    }

    /// Like [`create_session`](Self::create_session), also returning a
    /// receiver subscribed before the shell started
    pub async fn create_session_with_events(
        &self,
        cols: u16,
        rows: u16,
    ) -> Result<(Session, broadcast::Receiver<SessionEvent>)> {
        let mut sessions = self.sessions.write().await;

        let mut id = generate_session_id();
        while sessions.contains_key(&id) {
            id = generate_session_id();
        }

        let session = Arc::new(PTYSession::new(
            id.clone(),
            PTYSessionOptions {
                shell: self.config.resolve_shell(),
                cwd: self.config.resolve_cwd(),
                cols,
                rows,
            },
        ));

        // Subscribe before start so no output or exit can be missed
        let watcher_rx = session.subscribe();
        let events = session.subscribe();
        session.start()?;

        let info = session.info();
        sessions.insert(id.clone(), Arc::clone(&session));
        drop(sessions);

        tokio::spawn(watch_session(
            id.clone(),
            watcher_rx,
            Arc::clone(&self.sessions),
        ));

        info!(session_id = %id, pid = info.pid, cols, rows, "PTY session started");
        Ok((info, events))
    }

    /// Subscribe to a session's typed event stream
    pub async fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<SessionEvent>> {
        Ok(self.session(session_id).await?.subscribe())
    }

    /// Invoke `callback` with every raw data chunk the shell writes
    pub async fn handle_output<F>(&self, session_id: &str, callback: F) -> Result<JoinHandle<()>>
    where
        F: Fn(&[u8]) + Send + 'static,
    {
        let mut rx = self.subscribe(session_id).await?;
        let id = session_id.to_string();

        Ok(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Data(data)) => callback(&data),
                    Ok(SessionEvent::Exit(_)) | Ok(SessionEvent::Error(_)) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(session_id = %id, skipped = n, "Output subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(session_id = %id, "Output subscriber finished");
        }))
    }

    /// Write raw bytes to a session's input
    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> Result<()> {
        let session = self.session(session_id).await?;
        session.write(data).await?;
        Ok(())
    }

    pub async fn resize_session(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self.session(session_id).await?;
        session.resize(cols, rows)?;
        Ok(())
    }

    /// Succeeds iff the session is tracked
    pub async fn attach_to_session(&self, session_id: &str) -> Result<()> {
        self.session(session_id).await.map(|_| ())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        Ok(self.session(session_id).await?.info())
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|s| s.info()).collect()
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.is_running())
            .unwrap_or(false)
    }

    /// Kill a session and forget it. Unknown ids are a no-op.
    pub async fn close_session(&self, session_id: &str) {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };

        if let Some(session) = session {
            session.close().await;
            info!(session_id = %session_id, "PTY session closed");
        }
    }

    /// Close every tracked session
    pub async fn cleanup(&self) {
        info!("Shutting down all PTY sessions...");

        let session_ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };

        for session_id in session_ids {
            self.close_session(&session_id).await;
        }

        info!("All PTY sessions shut down");
    }

    async fn session(&self, session_id: &str) -> Result<Arc<PTYSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| TerminalError::SessionNotFound(session_id.to_string()))
    }
}

/// Remove a session from the table once its shell is gone
async fn watch_session(
    id: String,
    mut rx: broadcast::Receiver<SessionEvent>,
    sessions: SessionTable,
) {
    loop {
        match rx.recv().await {
            // Data chunks are not needed here
            Ok(SessionEvent::Data(_)) => {}
            Ok(SessionEvent::Exit(code)) => {
                info!(session_id = %id, exit_code = code, "Shell exited, removing session");
                break;
            }
            Ok(SessionEvent::Error(message)) => {
                error!(session_id = %id, error = %message, "PTY failed, removing session");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    let removed = sessions.write().await.remove(&id);
    if let Some(session) = removed {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_manager() -> PTYManager {
        PTYManager::new(PtyConfig {
            shell: Some("/bin/sh".to_string()),
            cwd: Some(std::env::temp_dir()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = PTYManager::default();

        let err = manager.send_input("pty-missing", b"ls\n").await.unwrap_err();
        assert!(matches!(err, TerminalError::SessionNotFound(ref id) if id == "pty-missing"));
        assert!(manager.attach_to_session("pty-missing").await.is_err());
        assert!(manager.resize_session("pty-missing", 10, 10).await.is_err());
        assert!(manager.subscribe("pty-missing").await.is_err());
        assert!(!manager.is_running("pty-missing").await);

        // Closing an unknown session is not an error
        manager.close_session("pty-missing").await;
        manager.cleanup().await;
        assert!(manager.list_sessions().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    #[ignore = "requires a pseudo-terminal"]
    async fn test_session_lifecycle() {
        let manager = sh_manager();
        let session = manager.create_session(100, 30).await.unwrap();
        assert!(session.id.starts_with("pty-"));
        assert_eq!((session.cols, session.rows), (100, 30));
        assert!(manager.is_running(&session.id).await);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager
            .handle_output(&session.id, move |data| {
                let _ = tx.send(data.to_vec());
            })
            .await
            .unwrap();

        manager.send_input(&session.id, b"echo ready-$((1+1))\n").await.unwrap();

        let mut seen = String::new();
        while !seen.contains("ready-2") {
            let chunk = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }

        manager.resize_session(&session.id, 120, 40).await.unwrap();
        assert_eq!(manager.get_session(&session.id).await.unwrap().cols, 120);

        manager.close_session(&session.id).await;
        manager.close_session(&session.id).await;
        assert!(manager.get_session(&session.id).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    #[ignore = "requires a pseudo-terminal"]
    async fn test_exited_shell_is_removed() {
        let manager = sh_manager();
        let session = manager.create_session(80, 24).await.unwrap();

        manager.send_input(&session.id, b"exit 0\n").await.unwrap();

        for _ in 0..100 {
            if manager.attach_to_session(&session.id).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("exited session was never removed");
    }
}
