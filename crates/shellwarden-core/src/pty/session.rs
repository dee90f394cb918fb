//! PTY Session - one shell process behind a pseudo-terminal
//!
//! portable-pty owns the process and the master side. Raw output is read on a
//! blocking thread and broadcast as [`SessionEvent`]s; the exit waiter runs on
//! another blocking thread and emits the final `Exit`.

use std::io::{Read, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::Session;

/// How long the exit waiter lets the reader drain after the shell exits
const READ_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-session channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Events emitted by a session, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw data from the PTY
    Data(Vec<u8>),
    /// Shell exited with this code (-1 if unknown)
    Exit(i32),
    /// PTY read failed; the session is unusable
    Error(String),
}

/// PTY session options
#[derive(Debug, Clone)]
pub struct PTYSessionOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Generate a session id of the form `pty-<unix-millis>-<8 hex>`
pub fn generate_session_id() -> String {
    format!(
        "pty-{}-{}",
        Utc::now().timestamp_millis(),
        &Uuid::new_v4().simple().to_string()[..8]
    )
}

/// A single shell running under a pseudo-terminal
pub struct PTYSession {
    /// Unique session ID
    pub id: String,
    shell: String,
    cwd: PathBuf,
    size: StdMutex<(u16, u16)>,

    // PTY process
    pid: StdMutex<Option<u32>>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    killer: StdMutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    pty_writer: Mutex<Option<Box<dyn IoWrite + Send>>>,
    running: Arc<AtomicBool>,

    event_tx: broadcast::Sender<SessionEvent>,
}

impl PTYSession {
    /// Create a session that is not started yet
    pub fn new(id: String, options: PTYSessionOptions) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            shell: options.shell,
            cwd: options.cwd,
            size: StdMutex::new((options.cols, options.rows)),
            pid: StdMutex::new(None),
            master: StdMutex::new(None),
            killer: StdMutex::new(None),
            pty_writer: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            event_tx,
        }
    }

    // ========== Lifecycle ==========

    /// Spawn the shell and start the reader and exit waiter
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(anyhow!("Session already started"));
        }

        let (cols, rows) = self.size();
        info!(session_id = %self.id, shell = %self.shell, cwd = %self.cwd.display(), "Starting PTY session");

        let pty_system = native_pty_system();
        let pty_pair = pty_system.openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(&self.cwd);
        // CommandBuilder starts empty; the shell inherits our environment
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let mut child = pty_pair.slave.spawn_command(cmd)?;
        // The reader only sees EOF once every slave handle is closed
        drop(pty_pair.slave);

        let pid = child.process_id().unwrap_or(0);
        *lock(&self.pid) = Some(pid);
        *lock(&self.killer) = Some(child.clone_killer());

        let reader = pty_pair.master.try_clone_reader()?;
        let writer = pty_pair.master.take_writer()?;
        *self.pty_writer.try_lock().map_err(|_| anyhow!("PTY writer busy"))? = Some(writer);
        *lock(&self.master) = Some(pty_pair.master);

        self.running.store(true, Ordering::SeqCst);
        info!(session_id = %self.id, pid, "PTY spawned");

        let read_handle = tokio::task::spawn_blocking({
            let id = self.id.clone();
            let event_tx = self.event_tx.clone();
            let running = Arc::clone(&self.running);
            move || read_loop(id, reader, event_tx, running)
        });

        let id = self.id.clone();
        let event_tx = self.event_tx.clone();
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let exit_status = tokio::task::spawn_blocking(move || child.wait())
                .await
                .ok()
                .and_then(|r| r.ok());

            let exit_code = exit_status.map(|s| s.exit_code() as i32).unwrap_or(-1);

            // Let trailing output reach subscribers before the exit
            if tokio::time::timeout(READ_DRAIN_TIMEOUT, read_handle).await.is_err() {
                debug!(session_id = %id, "PTY reader still open after exit");
            }

            running.store(false, Ordering::SeqCst);
            let _ = event_tx.send(SessionEvent::Exit(exit_code));
            info!(session_id = %id, exit_code, "PTY exited");
        });

        Ok(())
    }

    /// Force kill the shell. Safe to call more than once.
    pub async fn close(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);

        if let Some(mut killer) = lock(&self.killer).take() {
            if let Err(e) = killer.kill() {
                debug!(session_id = %self.id, error = %e, "Shell already gone");
            }
        }
        *self.pty_writer.lock().await = None;

        if was_running {
            info!(session_id = %self.id, "PTY session killed");
        }
    }

    // ========== I/O ==========

    /// Write raw bytes to the shell
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(anyhow!("Session not running"));
        }

        let mut writer_guard = self.pty_writer.lock().await;
        if let Some(ref mut writer) = *writer_guard {
            writer.write_all(data)?;
            writer.flush()?;
            debug!(session_id = %self.id, data_len = data.len(), "Wrote to PTY");
            Ok(())
        } else {
            Err(anyhow!("PTY writer not available"))
        }
    }

    /// Propagate a geometry change to the pseudo-terminal
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = lock(&self.master);
        let master = master
            .as_ref()
            .ok_or_else(|| anyhow!("Session not started"))?;
        master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        *lock(&self.size) = (cols, rows);
        debug!(session_id = %self.id, cols, rows, "PTY resized");
        Ok(())
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    // ========== Accessors ==========

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    /// Snapshot as the public [`Session`] value
    pub fn info(&self) -> Session {
        let (cols, rows) = self.size();
        Session {
            id: self.id.clone(),
            pid: self.pid().unwrap_or(0),
            cols,
            rows,
        }
    }
}

/// Blocking read loop. Ends on EOF, on close, or on a read error.
fn read_loop(
    id: String,
    mut reader: Box<dyn Read + Send>,
    event_tx: broadcast::Sender<SessionEvent>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let _ = event_tx.send(SessionEvent::Data(buf[..n].to_vec()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if is_hangup(&e) || !running.load(Ordering::SeqCst) => break,
            Err(e) => {
                error!(session_id = %id, error = %e, "PTY read error");
                running.store(false, Ordering::SeqCst);
                let _ = event_tx.send(SessionEvent::Error(e.to_string()));
                break;
            }
        }
    }
    debug!(session_id = %id, "PTY reader finished");
}

/// Linux reports EIO on the master once the slave side has hung up
fn is_hangup(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| {
        warn!("Recovered poisoned PTY session lock");
        poisoned.into_inner()
    })
}
