//! Configuration for stevedore.

use crate::runtime::layout::dirs as const_dirs;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use stevedore_shared::constants::{build as build_defaults, envs as const_envs};
use stevedore_shared::{StevedoreError, StevedoreResult};

/// Top-level options: where the store lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StevedoreOptions {
    pub home_dir: PathBuf,
}

impl Default for StevedoreOptions {
    fn default() -> Self {
        let home_dir = std::env::var(const_envs::STEVEDORE_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(const_dirs::STEVEDORE_DIR);
                path
            });

        Self { home_dir }
    }
}

/// How RUN steps are isolated from the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Run on the host with the working directory inside the staging root.
    Host,
    /// chroot into the staging root first (Linux, requires CAP_SYS_CHROOT).
    #[default]
    Chroot,
}

impl std::str::FromStr for Isolation {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Isolation::Host),
            "chroot" => Ok(Isolation::Chroot),
            other => Err(StevedoreError::InvalidArgument(format!(
                "unknown isolation '{other}' (expected host or chroot)"
            ))),
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Isolation::Host => write!(f, "host"),
            Isolation::Chroot => write!(f, "chroot"),
        }
    }
}

/// Options for a single build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Turn lint warnings into a build failure.
    #[serde(default)]
    pub strict: bool,

    /// Wall clock limit per RUN step. `None` means unbounded.
    #[serde(default)]
    pub step_timeout: Option<Duration>,

    /// Dependency manifest, relative to the build context. Parsed before
    /// any step runs when present.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Ignore the build cache and execute every step.
    #[serde(default)]
    pub no_cache: bool,
}

fn default_manifest() -> PathBuf {
    PathBuf::from(build_defaults::DEFAULT_MANIFEST)
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            strict: false,
            step_timeout: None,
            manifest: default_manifest(),
            no_cache: false,
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> StevedoreResult<()> {
        if self.manifest.is_absolute() {
            return Err(StevedoreError::Config(format!(
                "manifest path must be relative to the build context: {}",
                self.manifest.display()
            )));
        }
        if self.step_timeout.is_some_and(|t| t.is_zero()) {
            return Err(StevedoreError::Config(
                "step timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
