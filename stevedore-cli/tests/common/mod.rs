#![allow(dead_code)]

use assert_cmd::Command;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub use stevedore_test_utils::{python_context, write_file};

/// Recipe whose steps run on any host: no package manager involved.
pub const HOST_RECIPE: &str = r#"FROM python:3.11-slim
WORKDIR /app
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1
COPY requirements.txt .
RUN mkdir -p installed && cp requirements.txt installed/
COPY . .
EXPOSE 8000
CMD ["stevedore", "serve", "-k", "uvicorn.workers.UvicornWorker", "--bind", "0.0.0.0:8000", "app.main:app"]
"#;

/// Isolated home directory with a local `python:3.11-slim` base.
pub struct TestContext {
    pub home: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let home = TempDir::new().expect("Failed to create temp dir");
        stevedore_test_utils::write_python_base(&home.path().join("bases"));
        Self { home }
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_stevedore");
        let mut cmd = Command::new(bin_path);
        cmd.timeout(Duration::from_secs(60));
        cmd.arg("--home").arg(self.home.path());
        cmd
    }

    /// A standard-library process running the binary, for tests that signal it.
    pub fn new_process(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_stevedore"));
        cmd.arg("--home").arg(self.home.path());
        cmd
    }
}

/// Build context holding [`HOST_RECIPE`] next to the sample service.
pub fn host_context() -> TempDir {
    let dir = python_context();
    write_file(dir.path(), "Containerfile", HOST_RECIPE);
    dir
}

/// Executable shell script standing in for the Python interpreter.
pub fn fake_python(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("python");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
