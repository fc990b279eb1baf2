//! Listener inheritance for worker processes.
//!
//! Workers never bind. They receive the master's listening socket as a
//! fixed descriptor and serve from it. The hook runs after `fork()` and
//! before `exec()`, so it is restricted to async-signal-safe syscalls: no
//! allocation, no locks, no logging.

use std::os::fd::RawFd;
use stevedore_shared::constants::supervisor::LISTENER_FD;

/// Install `listener` as [`LISTENER_FD`] and close every other descriptor
/// above it. Returns a raw errno on failure.
pub fn inherit_listener_raw(listener: RawFd) -> Result<(), i32> {
    if listener == LISTENER_FD {
        // dup2 onto itself keeps FD_CLOEXEC, clear it by hand.
        let flags = unsafe { libc::fcntl(LISTENER_FD, libc::F_GETFD) };
        if flags < 0 {
            return Err(errno());
        }
        if unsafe { libc::fcntl(LISTENER_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(errno());
        }
    } else if unsafe { libc::dup2(listener, LISTENER_FD) } < 0 {
        return Err(errno());
    }

    close_fds_from_raw(LISTENER_FD + 1);
    Ok(())
}

/// Ask the kernel to send SIGTERM when the master dies (Linux only).
pub fn set_parent_death_signal_raw() -> Result<(), i32> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) };
        if rc != 0 {
            return Err(errno());
        }
    }
    Ok(())
}

fn close_fds_from_raw(first: RawFd) {
    #[cfg(target_os = "linux")]
    {
        let result = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                libc::c_uint::MAX,
                0 as libc::c_uint,
            )
        };
        if result == 0 {
            return;
        }
    }

    // Fallback: no close_range, and /proc may not be readable here.
    for fd in first..4096 {
        unsafe { libc::close(fd) };
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Register the worker pre-exec hook on `cmd`.
pub fn add_worker_hook(cmd: &mut tokio::process::Command, listener: RawFd) {
    // SAFETY: the hook only calls dup2, fcntl, close and prctl.
    unsafe {
        cmd.pre_exec(move || {
            inherit_listener_raw(listener).map_err(std::io::Error::from_raw_os_error)?;
            set_parent_death_signal_raw().map_err(std::io::Error::from_raw_os_error)?;
            Ok(())
        });
    }
}
