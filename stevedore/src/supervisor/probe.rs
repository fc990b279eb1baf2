//! Application load check, run before the port is bound.

use async_trait::async_trait;
use std::process::Stdio;

use super::spec::SupervisionSpec;
use stevedore_shared::{StevedoreResult, SupervisorError};

/// Checks that the configured application can be loaded.
#[async_trait]
pub trait AppProbe: Send + Sync {
    /// `Err(SupervisorError::AppLoad)` when the app does not load.
    async fn check(&self, spec: &SupervisionSpec) -> StevedoreResult<()>;
}

const IMPORT_CHECK: &str = r#"
import importlib, sys
sys.path.insert(0, ".")
module_name, attr, factory = sys.argv[1], sys.argv[2], sys.argv[3] == "1"
obj = getattr(importlib.import_module(module_name), attr)
if factory:
    obj = obj()
if not callable(obj):
    raise TypeError(f"{module_name}:{attr} is not callable")
"#;

/// Imports the module and resolves the attribute in a child interpreter,
/// with the same environment and working directory the workers get.
#[derive(Debug, Default, Clone)]
pub struct PythonImportProbe;

#[async_trait]
impl AppProbe for PythonImportProbe {
    async fn check(&self, spec: &SupervisionSpec) -> StevedoreResult<()> {
        let app = spec.app.to_string();
        let load_error = |reason: String| SupervisorError::AppLoad {
            app: app.clone(),
            reason,
        };

        let mut cmd = tokio::process::Command::new(&spec.python);
        cmd.arg("-c")
            .arg(IMPORT_CHECK)
            .arg(spec.app.module())
            .arg(spec.app.attribute())
            .arg(if spec.app.is_factory() { "1" } else { "0" });
        spec.env.apply_to(&mut cmd);
        if let Some(dir) = &spec.chdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| load_error(format!("cannot run {}: {}", spec.python, e)))?;

        let output = tokio::time::timeout(spec.boot_timeout, child.wait_with_output())
            .await
            .map_err(|_| load_error(format!("import did not finish within {:?}", spec.boot_timeout)))?
            .map_err(|e| load_error(format!("failed to wait for import check: {e}")))?;

        if output.status.success() {
            tracing::info!(app = %app, "Application loaded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            tracing::debug!(target: "stevedore::supervisor::probe", "{}", line);
        }
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("import check exited with {}", output.status));
        Err(load_error(reason).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_shared::StevedoreError;

    #[tokio::test]
    async fn test_missing_interpreter_is_load_error() {
        let spec = SupervisionSpec {
            python: "/nonexistent/python3".into(),
            ..Default::default()
        };
        let err = PythonImportProbe.check(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            StevedoreError::Supervisor(SupervisorError::AppLoad { .. })
        ));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_reason_is_last_stderr_line() {
        // A fake interpreter: ignores its arguments and fails like Python does.
        let temp = tempfile::tempdir().unwrap();
        let fake = temp.path().join("python");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho 'Traceback (most recent call last):' >&2\necho \"ModuleNotFoundError: No module named 'app'\" >&2\nexit 1\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = SupervisionSpec {
            python: fake.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let err = PythonImportProbe.check(&spec).await.unwrap_err();
        assert!(err.to_string().contains("ModuleNotFoundError"), "{err}");
    }

    #[tokio::test]
    async fn test_timeout_is_load_error() {
        let temp = tempfile::tempdir().unwrap();
        let fake = temp.path().join("python");
        std::fs::write(&fake, "#!/bin/sh\nexec sleep 30\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = SupervisionSpec {
            python: fake.to_string_lossy().into_owned(),
            boot_timeout: std::time::Duration::from_millis(200),
            ..Default::default()
        };
        let err = PythonImportProbe.check(&spec).await.unwrap_err();
        assert!(err.to_string().contains("did not finish"), "{err}");
    }
}
