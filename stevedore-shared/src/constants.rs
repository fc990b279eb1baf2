//! Shared constants.
//!
//! Defaults here are the documented values of every knob the builder and
//! the supervisor expose.

/// Environment variable names.
pub mod envs {
    /// Store root override.
    pub const STEVEDORE_HOME: &str = "STEVEDORE_HOME";

    /// Default worker count, as honoured by common Python process managers.
    pub const WEB_CONCURRENCY: &str = "WEB_CONCURRENCY";

    /// Disables `.pyc` writes.
    pub const PYTHONDONTWRITEBYTECODE: &str = "PYTHONDONTWRITEBYTECODE";

    /// Forces unbuffered stdout/stderr.
    pub const PYTHONUNBUFFERED: &str = "PYTHONUNBUFFERED";
}

/// Runtime network defaults.
pub mod network {
    /// Port the service binds and the image exposes.
    pub const DEFAULT_PORT: u16 = 8000;

    /// Bind host: all interfaces.
    pub const DEFAULT_HOST: &str = "0.0.0.0";
}

/// Process supervision defaults.
pub mod supervisor {
    /// Worker processes when neither `--workers` nor `WEB_CONCURRENCY` is set.
    pub const DEFAULT_WORKERS: usize = 1;

    /// Seconds in-flight requests get to finish after a termination signal.
    pub const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 30;

    /// Seconds the application import check may take.
    pub const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 30;

    /// A worker dying sooner than this after spawn counts as a boot failure.
    pub const BOOT_WINDOW_MS: u64 = 1000;

    /// Consecutive boot failures that halt the master.
    pub const MAX_BOOT_FAILURES: u32 = 5;

    /// First respawn delay after a boot failure; doubles up to the cap.
    pub const RESPAWN_BACKOFF_INITIAL_MS: u64 = 100;

    /// Respawn delay cap.
    pub const RESPAWN_BACKOFF_MAX_MS: u64 = 5000;

    /// Descriptor number the listening socket gets inside a worker.
    pub const LISTENER_FD: i32 = 3;

    /// Python interpreter used for workers and the import check.
    pub const DEFAULT_PYTHON: &str = "python";

    /// Program name written into the image command.
    pub const DEFAULT_PROGRAM: &str = "gunicorn";
}

/// Image builder defaults.
pub mod build {
    /// Recipe file looked up in the build context.
    pub const DEFAULT_RECIPE: &str = "Containerfile";

    /// Dependency manifest file name.
    pub const DEFAULT_MANIFEST: &str = "requirements.txt";

    /// Network timeout handed to the dependency installer, in seconds.
    pub const INSTALL_NETWORK_TIMEOUT_SECS: u64 = 900;

    /// Python runtime version of the canonical base image.
    pub const DEFAULT_PYTHON_VERSION: &str = "3.11";

    /// Working directory of the canonical recipe.
    pub const DEFAULT_WORKDIR: &str = "/app";

    /// Empty base image.
    pub const SCRATCH: &str = "scratch";

    /// Default tag when a reference carries none.
    pub const DEFAULT_TAG: &str = "latest";
}
