//! `RUN` step execution.
//!
//! The builder hands every `RUN` to a [`StepExecutor`]. What happens inside
//! the command is opaque: OS package managers and pip are black boxes that
//! either exit zero or fail the build.

use async_trait::async_trait;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::env::EnvSet;
use stevedore_shared::{BuildError, StevedoreError, StevedoreResult};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// One `RUN` invocation.
#[derive(Debug)]
pub struct RunRequest<'a> {
    /// 1-based step number, for errors and logs.
    pub step: usize,
    /// Canonical instruction text, for errors.
    pub instruction: &'a str,
    pub argv: &'a [String],
    /// Staging root filesystem.
    pub rootfs: &'a Path,
    /// Absolute working directory inside the image.
    pub workdir: &'a str,
    pub env: &'a EnvSet,
    pub timeout: Option<Duration>,
}

impl RunRequest<'_> {
    /// Working directory as a host path below the staging root.
    pub fn host_workdir(&self) -> PathBuf {
        self.rootfs.join(self.workdir.trim_start_matches('/'))
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the command; `Err` when it cannot start, exits non-zero or
    /// times out.
    async fn run(&self, request: &RunRequest<'_>) -> StevedoreResult<()>;
}

/// Runs commands directly on the host with the working directory inside
/// the staging root. Only suitable for commands that stay inside their
/// working directory.
#[derive(Debug, Default, Clone)]
pub struct HostExecutor;

#[async_trait]
impl StepExecutor for HostExecutor {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn run(&self, request: &RunRequest<'_>) -> StevedoreResult<()> {
        let (program, args) = split_argv(request)?;
        let workdir = request.host_workdir();
        std::fs::create_dir_all(&workdir).map_err(|e| {
            StevedoreError::Storage(format!("Failed to create {}: {}", workdir.display(), e))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&workdir);
        request.env.apply_to(&mut cmd);
        run_to_completion(cmd, request).await
    }
}

/// Runs commands chrooted into the staging root (needs `CAP_SYS_CHROOT`).
/// The environment is the image's, on top of a minimal `PATH` and `HOME`.
#[derive(Debug, Default, Clone)]
pub struct ChrootExecutor;

#[async_trait]
impl StepExecutor for ChrootExecutor {
    fn name(&self) -> &'static str {
        "chroot"
    }

    async fn run(&self, request: &RunRequest<'_>) -> StevedoreResult<()> {
        let (program, args) = split_argv(request)?;
        std::fs::create_dir_all(request.host_workdir()).map_err(|e| {
            StevedoreError::Storage(format!("Failed to create working directory: {e}"))
        })?;

        let root = CString::new(request.rootfs.as_os_str().as_bytes())
            .map_err(|e| StevedoreError::InvalidArgument(format!("rootfs path: {e}")))?;
        let workdir = CString::new(request.workdir.as_bytes())
            .map_err(|e| StevedoreError::InvalidArgument(format!("workdir: {e}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", "/root");
        request.env.apply_to(&mut cmd);

        // SAFETY: chroot and chdir are async-signal-safe; the CStrings were
        // allocated before fork.
        unsafe {
            cmd.pre_exec(move || {
                if libc::chroot(root.as_ptr()) != 0 || libc::chdir(workdir.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        run_to_completion(cmd, request).await
    }
}

fn split_argv<'a>(request: &'a RunRequest<'_>) -> StevedoreResult<(&'a str, &'a [String])> {
    match request.argv.split_first() {
        Some((program, args)) => Ok((program.as_str(), args)),
        None => Err(BuildError::InvalidRecipe(format!(
            "step {}: empty command",
            request.step
        ))
        .into()),
    }
}

/// Spawn in its own process group, forward output to tracing, enforce the
/// timeout and map the exit status.
async fn run_to_completion(mut cmd: Command, request: &RunRequest<'_>) -> StevedoreResult<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| BuildError::StepFailed {
        step: request.step,
        instruction: request.instruction.to_string(),
        status: format!("failed to start: {e}"),
    })?;

    let step = request.step;
    let mut forwarders = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(tokio::spawn(forward_lines(stdout, step)));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_lines(stderr, step)));
    }

    let status: ExitStatus = match request.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                if let Some(pid) = child.id() {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = child.kill().await;
                for task in forwarders {
                    task.abort();
                }
                return Err(BuildError::StepTimeout {
                    step,
                    instruction: request.instruction.to_string(),
                    timeout: limit,
                }
                .into());
            }
        },
        None => child.wait().await,
    }
    .map_err(|e| StevedoreError::Internal(format!("failed to wait for step {step}: {e}")))?;

    futures::future::join_all(forwarders).await;

    if status.success() {
        Ok(())
    } else {
        Err(BuildError::StepFailed {
            step,
            instruction: request.instruction.to_string(),
            status: status.to_string(),
        }
        .into())
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, step: usize) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "stevedore::build::run", step, "{}", line);
    }
}
