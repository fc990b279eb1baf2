//! Worker classes and the launcher seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::RawFd;
use std::process::Stdio;
use std::str::FromStr;

use super::app::AppRef;
use super::fd;
use super::spec::SupervisionSpec;
use stevedore_shared::constants::supervisor::LISTENER_FD;
use stevedore_shared::{StevedoreError, StevedoreResult, SupervisorError};

/// How a worker process serves connections.
///
/// Both classes run one asyncio event loop per worker process and differ
/// only in the loop and HTTP implementations they select.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerClass {
    /// Fastest available loop (uvloop when installed) and HTTP parser.
    #[default]
    Uvicorn,
    /// Pure-Python asyncio loop with the h11 protocol.
    UvicornH11,
}

impl WorkerClass {
    pub const ALL: [WorkerClass; 2] = [WorkerClass::Uvicorn, WorkerClass::UvicornH11];

    /// Classic dotted class name, as passed with `-k`.
    pub fn dotted_name(&self) -> &'static str {
        match self {
            WorkerClass::Uvicorn => "uvicorn.workers.UvicornWorker",
            WorkerClass::UvicornH11 => "uvicorn.workers.UvicornH11Worker",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            WorkerClass::Uvicorn => "uvicorn",
            WorkerClass::UvicornH11 => "uvicorn-h11",
        }
    }

    pub fn event_loop(&self) -> &'static str {
        match self {
            WorkerClass::Uvicorn => "auto",
            WorkerClass::UvicornH11 => "asyncio",
        }
    }

    pub fn http(&self) -> &'static str {
        match self {
            WorkerClass::Uvicorn => "auto",
            WorkerClass::UvicornH11 => "h11",
        }
    }

    /// argv of one worker serving `app` from the inherited listener.
    pub fn worker_argv(&self, python: &str, app: &AppRef) -> Vec<String> {
        let mut argv = vec![
            python.to_string(),
            "-m".to_string(),
            "uvicorn".to_string(),
            "--fd".to_string(),
            LISTENER_FD.to_string(),
            "--loop".to_string(),
            self.event_loop().to_string(),
            "--http".to_string(),
            self.http().to_string(),
        ];
        if app.is_factory() {
            argv.push("--factory".to_string());
        }
        argv.push(format!("{}:{}", app.module(), app.attribute()));
        argv
    }
}

impl FromStr for WorkerClass {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerClass::ALL
            .into_iter()
            .find(|class| s == class.dotted_name() || s.eq_ignore_ascii_case(class.short_name()))
            .ok_or_else(|| {
                let known: Vec<&str> = WorkerClass::ALL.iter().map(|c| c.dotted_name()).collect();
                StevedoreError::InvalidArgument(format!(
                    "unknown worker class '{}' (expected one of: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dotted_name())
    }
}

/// Everything a launcher gets to start one worker.
#[derive(Debug)]
pub struct LaunchContext<'a> {
    /// Sequence number of the worker within this master.
    pub worker_id: u64,
    /// The master's listening socket, to be inherited as fd 3.
    pub listener: RawFd,
    pub spec: &'a SupervisionSpec,
}

/// Starts worker processes. The master owns the returned child and waits on it.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, ctx: &LaunchContext<'_>) -> StevedoreResult<tokio::process::Child>;
}

/// Launches uvicorn workers for the configured class.
#[derive(Debug, Default, Clone)]
pub struct AsgiLauncher;

impl WorkerLauncher for AsgiLauncher {
    fn launch(&self, ctx: &LaunchContext<'_>) -> StevedoreResult<tokio::process::Child> {
        let spec = ctx.spec;
        let argv = spec.worker_class.worker_argv(&spec.python, &spec.app);
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        spawn_worker(cmd, ctx)
    }
}

/// Apply the configured environment and working directory, wire stdio, install
/// the listener hook and spawn.
pub fn spawn_worker(
    mut cmd: tokio::process::Command,
    ctx: &LaunchContext<'_>,
) -> StevedoreResult<tokio::process::Child> {
    let spec = ctx.spec;
    spec.env.apply_to(&mut cmd);
    if let Some(dir) = &spec.chdir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    fd::add_worker_hook(&mut cmd, ctx.listener);

    let child = cmd.spawn().map_err(|e| {
        SupervisorError::Spawn(format!("worker {}: {}", ctx.worker_id, e))
    })?;
    tracing::debug!(worker = ctx.worker_id, pid = ?child.id(), "Spawned worker");
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("uvicorn.workers.UvicornWorker", WorkerClass::Uvicorn)]
    #[case("uvicorn", WorkerClass::Uvicorn)]
    #[case("uvicorn.workers.UvicornH11Worker", WorkerClass::UvicornH11)]
    #[case("UVICORN-H11", WorkerClass::UvicornH11)]
    fn test_parse_worker_class(#[case] input: &str, #[case] expected: WorkerClass) {
        assert_eq!(input.parse::<WorkerClass>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_class_lists_choices() {
        let err = "sync".parse::<WorkerClass>().unwrap_err().to_string();
        assert!(err.contains("uvicorn.workers.UvicornWorker"));
        assert!(err.contains("uvicorn.workers.UvicornH11Worker"));
    }

    #[test]
    fn test_worker_argv_serves_from_fd() {
        let app = AppRef::default();
        let argv = WorkerClass::UvicornH11.worker_argv("python3", &app);
        assert_eq!(
            argv,
            vec![
                "python3", "-m", "uvicorn", "--fd", "3", "--loop", "asyncio", "--http", "h11",
                "app.main:app"
            ]
        );
    }

    #[test]
    fn test_factory_flag() {
        let app: AppRef = "svc:build()".parse().unwrap();
        let argv = WorkerClass::Uvicorn.worker_argv("python", &app);
        assert!(argv.contains(&"--factory".to_string()));
        assert_eq!(argv.last().unwrap(), "svc:build");
        assert!(!argv.iter().any(|a| a.contains("--bind")));
    }
}
