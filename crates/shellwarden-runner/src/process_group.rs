//! Process-group signalling for sandbox workers.
//!
//! Workers are spawned as the leader of a fresh process group (pgid == pid),
//! so signalling the group also reaches anything the worker forked.
//! On non-Unix platforms these helpers are no-ops.

use std::io;

/// Signal to send to a worker group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM - allows graceful shutdown
    Term,
    /// SIGKILL - immediate termination
    #[default]
    Kill,
}

#[cfg(unix)]
impl KillSignal {
    fn as_libc_signal(self) -> libc::c_int {
        match self {
            KillSignal::Term => libc::SIGTERM,
            KillSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Signal a process group (best-effort). A group that no longer exists is not an error.
#[cfg(unix)]
pub fn kill_process_group(process_group_id: u32, signal: KillSignal) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(process_group_id)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"))?;
    if pgid <= 1 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pgid <= 1"));
    }

    let result = unsafe { libc::killpg(pgid, signal.as_libc_signal()) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }

    Ok(())
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn kill_process_group(_process_group_id: u32, _signal: KillSignal) -> io::Result<()> {
    Ok(())
}
