//! Process signalling helpers.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Check if a process with the given PID exists.
///
/// Uses a null signal; permission errors count as "not ours".
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Send `signal` to `pid`.
///
/// # Returns
/// * `true` - Signal delivered, or the process is already gone
/// * `false` - Delivery failed for another reason (permission denied)
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => true,
        Err(e) => {
            tracing::warn!(pid, ?signal, error = %e, "Failed to signal process");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        assert!(!is_process_alive(999999999));
    }

    #[test]
    fn test_send_signal_to_missing_process() {
        assert!(send_signal(999999999, Signal::SIGTERM));
    }

    #[test]
    fn test_send_signal_terminates_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        assert!(send_signal(child.id(), Signal::SIGKILL));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
