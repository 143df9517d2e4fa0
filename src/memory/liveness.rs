//! Best-effort process liveness checks
//!
//! Processes crash independently, so ownership recorded in shared memory is
//! tied to a pid and checked with a null signal before anything is reclaimed.

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

/// Pid of the calling process as stored in shared memory
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with the given pid exists
///
/// `EPERM` means the process exists but belongs to another user, so it is
/// reported alive. Pid 0 never refers to a peer and is reported dead.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_process_alive(current_pid()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
        // above the default pid_max on every supported platform
        assert!(!is_process_alive(i32::MAX as u32 - 1));
    }
}
