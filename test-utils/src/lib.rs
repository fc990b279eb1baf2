//! Test doubles and fixtures shared by the stevedore test suites.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinSet;

use stevedore::build::{RunRequest, StepExecutor};
use stevedore::images::{ImageStore, LocalBaseImages};
use stevedore::supervisor::{
    AppProbe, LaunchContext, SupervisionSpec, WorkerLauncher, spawn_worker,
};
use stevedore::{BuildError, FilesystemLayout, StevedoreResult, SupervisorError};

// ============================================================================
// BUILD
// ============================================================================

/// Step executor that records every command instead of running it.
///
/// Each executed step leaves `var/lib/stevedore-test/step-<n>` in the
/// staging root so the step still produces a layer. Commands containing
/// the failure pattern exit non-zero.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(pattern: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(pattern.to_string()),
        }
    }

    /// Instructions executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl StepExecutor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn run(&self, request: &RunRequest<'_>) -> StevedoreResult<()> {
        self.calls.lock().push(request.instruction.to_string());

        if let Some(pattern) = &self.fail_on
            && request.instruction.contains(pattern.as_str())
        {
            return Err(BuildError::StepFailed {
                step: request.step,
                instruction: request.instruction.to_string(),
                status: "exit status: 1".into(),
            }
            .into());
        }

        let marker_dir = request.rootfs.join("var/lib/stevedore-test");
        std::fs::create_dir_all(&marker_dir).map_err(|e| {
            stevedore::StevedoreError::Storage(format!("test marker dir: {e}"))
        })?;
        std::fs::write(
            marker_dir.join(format!("step-{}", request.step)),
            request.instruction,
        )
        .map_err(|e| stevedore::StevedoreError::Storage(format!("test marker: {e}")))?;
        Ok(())
    }
}

/// A store in a temporary home with a minimal `python:3.11-slim` base.
pub struct TestStore {
    pub home: TempDir,
    pub store: Arc<ImageStore>,
    pub bases: Arc<LocalBaseImages>,
}

impl TestStore {
    pub fn new() -> Self {
        let home = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(home.path().to_path_buf());
        let store = Arc::new(ImageStore::open(layout.clone()).unwrap());
        write_python_base(&layout.bases_dir());
        let bases = Arc::new(LocalBaseImages::new(layout.bases_dir()));
        Self { home, store, bases }
    }

    pub fn path(&self) -> &Path {
        self.home.path()
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Lay out `bases/python/3.11-slim/` with a few recognisable files.
pub fn write_python_base(bases_dir: &Path) {
    let root = bases_dir.join("python/3.11-slim");
    std::fs::create_dir_all(root.join("etc")).unwrap();
    std::fs::create_dir_all(root.join("usr/local/bin")).unwrap();
    std::fs::create_dir_all(root.join("var/lib/apt/lists")).unwrap();
    std::fs::write(root.join("etc/os-release"), "ID=debian\nVERSION_ID=\"12\"\n").unwrap();
    std::fs::write(root.join("usr/local/bin/python3"), "#!/bin/sh\n").unwrap();
}

/// Build context of a small ASGI service with `foo==1.0` as its only
/// dependency.
pub fn python_context() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "requirements.txt", "foo==1.0\n");
    write_file(dir.path(), "app/__init__.py", "");
    write_file(
        dir.path(),
        "app/main.py",
        "async def app(scope, receive, send):\n    pass\n",
    );
    dir
}

pub fn write_file(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}

// ============================================================================
// SUPERVISOR
// ============================================================================

/// Probe with a fixed verdict that counts its calls.
pub struct StubProbe {
    ok: bool,
    calls: AtomicUsize,
}

impl StubProbe {
    pub fn loads() -> Arc<Self> {
        Arc::new(Self {
            ok: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn fails() -> Arc<Self> {
        Arc::new(Self {
            ok: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AppProbe for StubProbe {
    async fn check(&self, spec: &SupervisionSpec) -> StevedoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.ok {
            Ok(())
        } else {
            Err(SupervisorError::AppLoad {
                app: spec.app.to_string(),
                reason: "ModuleNotFoundError: No module named 'app'".into(),
            }
            .into())
        }
    }
}

/// Launches `/bin/sh -c <script>` as a worker, with the real listener
/// inheritance and environment wiring.
pub struct ShellLauncher {
    script: String,
    pids: Mutex<Vec<u32>>,
}

impl ShellLauncher {
    pub fn new(script: &str) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_string(),
            pids: Mutex::new(Vec::new()),
        })
    }

    /// A worker that idles until signalled.
    pub fn sleeper() -> Arc<Self> {
        Self::new("exec sleep 600")
    }

    /// A worker that ignores SIGTERM.
    pub fn stubborn() -> Arc<Self> {
        Self::new("trap '' TERM; while true; do sleep 1; done")
    }

    pub fn launched(&self) -> usize {
        self.pids.lock().len()
    }

    /// Pids of every worker launched so far, oldest first.
    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().clone()
    }
}

impl WorkerLauncher for ShellLauncher {
    fn launch(&self, ctx: &LaunchContext<'_>) -> StevedoreResult<tokio::process::Child> {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(&self.script);
        let child = spawn_worker(cmd, ctx)?;
        if let Some(pid) = child.id() {
            self.pids.lock().push(pid);
        }
        Ok(child)
    }
}

/// Set in the environment of a re-executed test binary acting as a worker.
pub const DRAINING_WORKER_ENV: &str = "STEVEDORE_TEST_DRAINING_WORKER";

/// Launches the current test binary as a worker that answers connections on
/// the inherited fd 3 (see [`run_draining_worker`]).
///
/// The binary must define an `#[ignore]`d test named `entry` whose body is
/// `run_draining_worker()`; the launcher runs exactly that test.
pub struct DrainingLauncher {
    entry: String,
    pids: Mutex<Vec<u32>>,
}

impl DrainingLauncher {
    pub fn new(entry: &str) -> Arc<Self> {
        Arc::new(Self {
            entry: entry.to_string(),
            pids: Mutex::new(Vec::new()),
        })
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().clone()
    }
}

impl WorkerLauncher for DrainingLauncher {
    fn launch(&self, ctx: &LaunchContext<'_>) -> StevedoreResult<tokio::process::Child> {
        let exe = std::env::current_exe()
            .map_err(|e| SupervisorError::Spawn(format!("test binary: {e}")))?;
        let mut cmd = tokio::process::Command::new(exe);
        cmd.args([self.entry.as_str(), "--exact", "--ignored", "--nocapture", "--quiet"])
            .env(DRAINING_WORKER_ENV, "1");
        let child = spawn_worker(cmd, ctx)?;
        if let Some(pid) = child.id() {
            self.pids.lock().push(pid);
        }
        Ok(child)
    }
}

/// Worker body for [`DrainingLauncher`]. Does nothing unless
/// [`DRAINING_WORKER_ENV`] is set.
///
/// Each connection sends one line and gets `accepted\n` back at once. The
/// rest of the reply, `done\n`, is held until SIGTERM. SIGTERM closes the
/// listener, lets every held reply finish, and then exits the process.
pub fn run_draining_worker() {
    if std::env::var_os(DRAINING_WORKER_ENV).is_none() {
        return;
    }
    // Claim the inherited listener before the runtime allocates descriptors.
    let listener = unsafe { TcpListener::from_raw_fd(3) };
    listener.set_nonblocking(true).unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(serve_until_terminated(listener));
    std::process::exit(0);
}

async fn serve_until_terminated(listener: TcpListener) {
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
    let mut terminate = signal(SignalKind::terminate()).unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut replies = JoinSet::new();

    loop {
        tokio::select! {
            _ = terminate.recv() => break,
            accepted = listener.accept() => {
                if let Ok((stream, _)) = accepted {
                    replies.spawn(held_reply(stream, stop_rx.clone()));
                }
            }
        }
    }

    drop(listener);
    let _ = stop_tx.send(true);
    while replies.join_next().await.is_some() {}
    // Linger so the clients see EOF before the master reaps us.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn held_reply(stream: tokio::net::TcpStream, mut stop: watch::Receiver<bool>) {
    let (read, mut write) = stream.into_split();
    let mut request = String::new();
    if BufReader::new(read).read_line(&mut request).await.is_err() {
        return;
    }
    if write.write_all(b"accepted\n").await.is_err() {
        return;
    }
    let _ = stop.wait_for(|stopped| *stopped).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = write.write_all(b"done\n").await;
    let _ = write.shutdown().await;
}

/// Supervision spec bound to an ephemeral loopback port with short timers.
pub fn test_spec(workers: usize) -> SupervisionSpec {
    SupervisionSpec {
        bind: "127.0.0.1:0".parse().unwrap(),
        workers,
        graceful_timeout: Duration::from_secs(5),
        boot_window: Duration::from_millis(200),
        respawn_backoff_initial: Duration::from_millis(10),
        respawn_backoff_max: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Whether a TCP connection to `addr` succeeds.
pub fn can_connect(addr: SocketAddr) -> bool {
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

/// Poll until `addr` accepts connections or `timeout` passes.
pub fn wait_for_port(addr: SocketAddr, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if can_connect(addr) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Poll until `addr` refuses connections or `timeout` passes.
pub fn wait_for_port_closed(addr: SocketAddr, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !can_connect(addr) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Whether a process with `pid` still exists (zombies included).
pub fn pid_exists(pid: u32) -> bool {
    stevedore::util::process::is_process_alive(pid)
}

/// Send SIGKILL to `pid`, as an outside crash would.
pub fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}
