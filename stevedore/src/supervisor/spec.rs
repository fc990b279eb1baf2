//! Supervision configuration, fixed for the life of one master.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::app::AppRef;
use super::bind::BindAddress;
use super::worker::WorkerClass;
use crate::env::EnvSet;
use stevedore_shared::constants::supervisor as defaults;
use stevedore_shared::{StevedoreError, StevedoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionSpec {
    pub app: AppRef,
    pub worker_class: WorkerClass,
    pub bind: BindAddress,

    /// Initial number of workers.
    pub workers: usize,

    /// How long workers get to finish after SIGTERM before SIGKILL.
    pub graceful_timeout: Duration,

    /// Upper bound for the application import check.
    pub boot_timeout: Duration,

    /// A worker exiting sooner than this after spawn failed to boot.
    pub boot_window: Duration,

    /// Consecutive boot failures after which the master gives up.
    pub max_boot_failures: u32,

    pub respawn_backoff_initial: Duration,
    pub respawn_backoff_max: Duration,

    /// Python interpreter used for the import check and the workers.
    pub python: String,

    /// Working directory of the import check and the workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chdir: Option<PathBuf>,

    /// Environment applied to every spawned process.
    #[serde(default)]
    pub env: EnvSet,
}

impl Default for SupervisionSpec {
    fn default() -> Self {
        Self {
            app: AppRef::default(),
            worker_class: WorkerClass::default(),
            bind: BindAddress::default(),
            workers: defaults::DEFAULT_WORKERS,
            graceful_timeout: Duration::from_secs(defaults::DEFAULT_GRACEFUL_TIMEOUT_SECS),
            boot_timeout: Duration::from_secs(defaults::DEFAULT_BOOT_TIMEOUT_SECS),
            boot_window: Duration::from_millis(defaults::BOOT_WINDOW_MS),
            max_boot_failures: defaults::MAX_BOOT_FAILURES,
            respawn_backoff_initial: Duration::from_millis(defaults::RESPAWN_BACKOFF_INITIAL_MS),
            respawn_backoff_max: Duration::from_millis(defaults::RESPAWN_BACKOFF_MAX_MS),
            python: defaults::DEFAULT_PYTHON.to_string(),
            chdir: None,
            env: EnvSet::container_defaults(),
        }
    }
}

impl SupervisionSpec {
    pub fn new(app: AppRef, worker_class: WorkerClass, bind: BindAddress) -> Self {
        Self {
            app,
            worker_class,
            bind,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> StevedoreResult<()> {
        if self.workers == 0 {
            return Err(StevedoreError::Config("workers must be at least 1".into()));
        }
        if self.max_boot_failures == 0 {
            return Err(StevedoreError::Config(
                "max_boot_failures must be at least 1".into(),
            ));
        }
        if self.python.is_empty() {
            return Err(StevedoreError::Config("python interpreter is empty".into()));
        }
        if self.respawn_backoff_initial > self.respawn_backoff_max {
            return Err(StevedoreError::Config(
                "respawn backoff start exceeds its cap".into(),
            ));
        }
        self.env.check_container_invariants()
    }

    /// Delay before the next respawn after `failures` consecutive boot
    /// failures: zero for none, then doubling up to the cap.
    pub fn respawn_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.respawn_backoff_initial
            .checked_mul(factor)
            .unwrap_or(self.respawn_backoff_max)
            .min(self.respawn_backoff_max)
    }
}

/// Worker count: explicit value, then `WEB_CONCURRENCY`, then the default.
pub fn resolve_worker_count(
    explicit: Option<usize>,
    web_concurrency: Option<&str>,
) -> StevedoreResult<usize> {
    if let Some(count) = explicit {
        return Ok(count);
    }
    match web_concurrency.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value.parse::<usize>().map_err(|_| {
            StevedoreError::Config(format!("WEB_CONCURRENCY must be a number, got '{value}'"))
        }),
        None => Ok(defaults::DEFAULT_WORKERS),
    }
}
