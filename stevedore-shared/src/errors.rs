//! Error types shared by every stevedore crate.
//!
//! Errors are split by where they can be recovered:
//! - [`BuildError`]: build-fatal, aborts the whole build, no image produced
//! - [`SupervisorError`]: fatal to the supervisor, surfaced as an exit status
//! - the flat [`StevedoreError`] variants: storage, configuration and state
//!   problems of the tool itself

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the workspace.
pub type StevedoreResult<T> = Result<T, StevedoreError>;

/// Top-level error for stevedore operations.
#[derive(Debug, Error)]
pub enum StevedoreError {
    /// Filesystem or on-disk store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration (options, environment, flags).
    #[error("config error: {0}")]
    Config(String),

    /// A caller passed a malformed value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Image record or layer problem.
    #[error("image error: {0}")]
    Image(String),

    /// Build aborted.
    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    /// Supervisor could not start or had to halt.
    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StevedoreError {
    /// Process exit code for this error.
    ///
    /// Worker boot and application load failures keep the exit statuses
    /// process supervisors conventionally use for them (3 and 4).
    pub fn exit_code(&self) -> i32 {
        match self {
            StevedoreError::Supervisor(SupervisorError::WorkerBoot { .. }) => 3,
            StevedoreError::Supervisor(SupervisorError::AppLoad { .. }) => 4,
            _ => 1,
        }
    }
}

/// Build-fatal errors. None of them is retried; each aborts the build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The base image reference could not be resolved.
    #[error("base image {reference} unavailable: {reason}")]
    BaseImageUnavailable { reference: String, reason: String },

    /// The recipe is structurally invalid.
    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),

    /// The dependency manifest could not be read or parsed.
    #[error("dependency manifest: {0}")]
    Manifest(String),

    /// Lint findings were promoted to errors (strict mode).
    #[error("recipe lint failed: {}", .0.join("; "))]
    Lint(Vec<String>),

    /// A RUN step exited unsuccessfully.
    #[error("step {step} `{instruction}` failed: {status}")]
    StepFailed {
        step: usize,
        instruction: String,
        status: String,
    },

    /// A RUN step exceeded its wall clock timeout.
    #[error("step {step} `{instruction}` timed out after {timeout:?}")]
    StepTimeout {
        step: usize,
        instruction: String,
        timeout: Duration,
    },

    /// A COPY source is missing or escapes the build context.
    #[error("copy source {source_path}: {reason}")]
    CopySource { source_path: String, reason: String },

    /// Another build holds the store lock.
    #[error("store {0} is locked by another build")]
    Locked(String),
}

/// Errors that stop the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The application reference failed to import or load.
    #[error("failed to load application {app}: {reason}")]
    AppLoad { app: String, reason: String },

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// A worker process could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Workers keep dying right after boot; the master halts.
    #[error("worker failed to boot {failures} times in a row")]
    WorkerBoot { failures: u32 },
}
