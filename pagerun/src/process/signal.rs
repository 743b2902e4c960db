//! Signal helpers for spawned tool processes.
//!
//! Tools are spawned as leaders of their own process group (pgid == pid),
//! so anything they start can be signalled through the group.

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
#[cfg(unix)]
pub(crate) fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Ask a process to terminate with SIGTERM.
///
/// # Returns
/// * `true` - Signal was delivered
/// * `false` - Process doesn't exist or permission denied
#[cfg(unix)]
pub(crate) fn terminate_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 }
}

/// Send SIGTERM to every process in the group led by `pgid`.
#[cfg(unix)]
pub(crate) fn terminate_group(pgid: u32) -> bool {
    signal_group(pgid, libc::SIGTERM)
}

/// Send SIGKILL to every process in the group led by `pgid`.
#[cfg(unix)]
pub(crate) fn kill_group(pgid: u32) -> bool {
    signal_group(pgid, libc::SIGKILL)
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: i32) -> bool {
    // 0 and 1 would address our own group and init's
    if pgid <= 1 {
        return false;
    }
    unsafe { libc::kill(-(pgid as i32), signal) == 0 }
}
