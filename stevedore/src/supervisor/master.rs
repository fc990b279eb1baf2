//! The master process loop.
//!
//! The master validates the application, binds the listener once, then
//! supervises workers from a single task: one `JoinSet` entry per worker
//! waits on its child, and the loop reacts to worker exits, control
//! messages and respawn timers. Workers are only ever signalled, never
//! shared with.

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::process::ExitStatus;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use super::probe::{AppProbe, PythonImportProbe};
use super::spec::SupervisionSpec;
use super::state::SupervisorState;
use super::worker::{AsgiLauncher, LaunchContext, WorkerLauncher};
use crate::util::process::send_signal;
use stevedore_shared::{StevedoreError, StevedoreResult, SupervisorError};

/// Requests a running master understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Close the listener and drain workers.
    Shutdown,
    /// Replace every worker with a fresh one.
    Reload,
    IncreaseWorkers,
    DecreaseWorkers,
}

/// Point-in-time view of the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub state: SupervisorState,
    /// Bound address, once the listener exists.
    pub address: Option<SocketAddr>,
    /// Live workers, including ones being retired.
    pub workers: usize,
    pub target_workers: usize,
    /// Unexpected worker exits so far.
    pub restarts: u64,
    /// Current run of consecutive boot failures.
    pub boot_failures: u32,
}

/// How a master that shut down cleanly ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub restarts: u64,
    /// Workers still alive when the grace period ran out.
    pub forced_kills: usize,
}

/// Configured master, not yet running.
pub struct Supervisor {
    spec: SupervisionSpec,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn AppProbe>,
}

impl Supervisor {
    pub fn new(spec: SupervisionSpec) -> Self {
        Self {
            spec,
            launcher: Arc::new(AsgiLauncher),
            probe: Arc::new(PythonImportProbe),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn AppProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn spec(&self) -> &SupervisionSpec {
        &self.spec
    }

    /// Start the master on the current tokio runtime.
    pub fn spawn(self) -> StevedoreResult<SupervisorHandle> {
        self.spec.validate()?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let initial = Snapshot {
            state: SupervisorState::Starting,
            address: None,
            workers: 0,
            target_workers: self.spec.workers,
            restarts: 0,
            boot_failures: 0,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let master = Master {
            target: self.spec.workers,
            spec: self.spec,
            launcher: self.launcher,
            probe: self.probe,
            state: SupervisorState::Starting,
            listener: None,
            address: None,
            workers: BTreeMap::new(),
            tasks: JoinSet::new(),
            next_id: 1,
            restarts: 0,
            boot_failures: 0,
            respawn_at: None,
            status: status_tx,
        };
        let task = tokio::spawn(master.run(control_rx));

        Ok(SupervisorHandle {
            controls: control_tx,
            status: status_rx,
            task,
        })
    }
}

/// Cloneable sender of [`Control`] messages.
#[derive(Debug, Clone)]
pub struct SupervisorControl {
    tx: mpsc::UnboundedSender<Control>,
}

impl SupervisorControl {
    pub fn send(&self, control: Control) -> StevedoreResult<()> {
        self.tx
            .send(control)
            .map_err(|_| StevedoreError::InvalidState("supervisor is not running".into()))
    }
}

/// Handle to a running master.
pub struct SupervisorHandle {
    controls: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<Snapshot>,
    task: JoinHandle<StevedoreResult<ExitReport>>,
}

impl SupervisorHandle {
    pub fn controller(&self) -> SupervisorControl {
        SupervisorControl {
            tx: self.controls.clone(),
        }
    }

    pub fn send(&self, control: Control) -> StevedoreResult<()> {
        self.controller().send(control)
    }

    pub fn shutdown(&self) -> StevedoreResult<()> {
        self.send(Control::Shutdown)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.status.borrow().clone()
    }

    /// Wait until `predicate` holds or the master is gone; returns the
    /// snapshot that ended the wait.
    pub async fn wait_for(&mut self, predicate: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let result = self
            .status
            .wait_for(|s| predicate(s) || s.state.is_terminal())
            .await
            .map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }

    /// Wait until workers are being supervised (or startup failed).
    pub async fn wait_until_running(&mut self) -> Snapshot {
        self.wait_for(|s| s.state == SupervisorState::Running && s.workers >= s.target_workers)
            .await
    }

    /// Wait for the master to finish.
    pub async fn wait(self) -> StevedoreResult<ExitReport> {
        self.task
            .await
            .map_err(|e| StevedoreError::Internal(format!("supervisor task failed: {e}")))?
    }
}

struct WorkerSlot {
    pid: Option<u32>,
    started: Instant,
    /// Asked to exit by the master; its exit is not a crash.
    retiring: bool,
}

struct Master {
    spec: SupervisionSpec,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn AppProbe>,
    state: SupervisorState,
    listener: Option<TcpListener>,
    address: Option<SocketAddr>,
    workers: BTreeMap<u64, WorkerSlot>,
    tasks: JoinSet<(u64, std::io::Result<ExitStatus>)>,
    next_id: u64,
    target: usize,
    restarts: u64,
    boot_failures: u32,
    respawn_at: Option<Instant>,
    status: watch::Sender<Snapshot>,
}

impl Master {
    async fn run(
        mut self,
        mut controls: mpsc::UnboundedReceiver<Control>,
    ) -> StevedoreResult<ExitReport> {
        self.transition(SupervisorState::ValidatingApp)?;
        if let Err(e) = self.probe.check(&self.spec).await {
            tracing::error!(app = %self.spec.app, error = %e, "Application failed to load");
            self.transition(SupervisorState::Crashed)?;
            return Err(e);
        }

        let bind = self.spec.bind;
        let listener = match TcpListener::bind(bind.socket_addr()) {
            Ok(listener) => listener,
            Err(e) => {
                self.transition(SupervisorState::Crashed)?;
                return Err(SupervisorError::Bind {
                    address: bind.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
        };
        self.address = listener.local_addr().ok();
        self.listener = Some(listener);
        self.transition(SupervisorState::Running)?;
        tracing::info!(
            address = ?self.address,
            workers = self.target,
            worker_class = %self.spec.worker_class,
            app = %self.spec.app,
            "Listening"
        );

        for _ in 0..self.target {
            if let Err(e) = self.spawn_worker() {
                self.halt().await?;
                return Err(e);
            }
        }
        self.publish();

        let mut controls_open = true;
        loop {
            let respawn_at = self.respawn_at;
            tokio::select! {
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok((id, status)) => self.on_worker_exit(id, status).await?,
                        Err(e) => tracing::warn!(error = %e, "Worker wait task failed"),
                    }
                }
                control = controls.recv(), if controls_open => match control {
                    Some(Control::Shutdown) => break,
                    Some(other) => self.on_control(other).await?,
                    None => controls_open = false,
                },
                _ = tokio::time::sleep_until(respawn_at.unwrap_or_else(Instant::now)), if respawn_at.is_some() => {
                    self.respawn_at = None;
                    self.fill().await?;
                }
                else => break,
            }
            self.publish();
        }

        self.drain().await
    }

    fn transition(&mut self, target: SupervisorState) -> StevedoreResult<()> {
        self.state.transition(target)?;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.status.send_replace(Snapshot {
            state: self.state,
            address: self.address,
            workers: self.workers.len(),
            target_workers: self.target,
            restarts: self.restarts,
            boot_failures: self.boot_failures,
        });
    }

    fn live_workers(&self) -> usize {
        self.workers.values().filter(|w| !w.retiring).count()
    }

    fn spawn_worker(&mut self) -> StevedoreResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| StevedoreError::InvalidState("listener is closed".into()))?;
        let id = self.next_id;
        let ctx = LaunchContext {
            worker_id: id,
            listener: listener.as_raw_fd(),
            spec: &self.spec,
        };
        let mut child = self.launcher.launch(&ctx)?;
        self.next_id += 1;

        let pid = child.id();
        self.workers.insert(
            id,
            WorkerSlot {
                pid,
                started: Instant::now(),
                retiring: false,
            },
        );
        self.tasks.spawn(async move {
            let status = child.wait().await;
            (id, status)
        });
        tracing::info!(worker = id, pid = ?pid, "Booted worker");
        Ok(())
    }

    /// Spawn workers until the target is met. Spawn failures count as boot
    /// failures and back off like early exits do.
    async fn fill(&mut self) -> StevedoreResult<()> {
        while self.live_workers() < self.target {
            if let Err(e) = self.spawn_worker() {
                tracing::warn!(error = %e, "Failed to spawn worker");
                self.record_boot_failure().await?;
                self.schedule_respawn();
                break;
            }
        }
        Ok(())
    }

    async fn record_boot_failure(&mut self) -> StevedoreResult<()> {
        self.boot_failures += 1;
        if self.boot_failures >= self.spec.max_boot_failures {
            let failures = self.boot_failures;
            tracing::error!(failures, "Workers keep failing to boot, shutting down");
            self.halt().await?;
            return Err(SupervisorError::WorkerBoot { failures }.into());
        }
        Ok(())
    }

    fn schedule_respawn(&mut self) {
        let at = Instant::now() + self.spec.respawn_delay(self.boot_failures);
        self.respawn_at = Some(match self.respawn_at {
            Some(existing) => existing.min(at),
            None => at,
        });
    }

    async fn on_worker_exit(
        &mut self,
        id: u64,
        status: std::io::Result<ExitStatus>,
    ) -> StevedoreResult<()> {
        let Some(slot) = self.workers.remove(&id) else {
            return Ok(());
        };
        if slot.retiring {
            tracing::info!(worker = id, pid = ?slot.pid, "Retired worker exited");
            return Ok(());
        }

        let uptime = slot.started.elapsed();
        self.restarts += 1;
        tracing::warn!(
            worker = id,
            pid = ?slot.pid,
            status = ?status,
            uptime_ms = uptime.as_millis() as u64,
            "Worker exited unexpectedly"
        );

        if uptime < self.spec.boot_window {
            self.record_boot_failure().await?;
        } else {
            self.boot_failures = 0;
        }
        self.transition(SupervisorState::Running)?;

        if self.boot_failures == 0 {
            self.fill().await
        } else {
            self.schedule_respawn();
            Ok(())
        }
    }

    async fn on_control(&mut self, control: Control) -> StevedoreResult<()> {
        match control {
            Control::Shutdown => {}
            Control::Reload => {
                let old: Vec<Option<u32>> = self
                    .workers
                    .values_mut()
                    .filter(|w| !w.retiring)
                    .map(|w| {
                        w.retiring = true;
                        w.pid
                    })
                    .collect();
                tracing::info!(replacing = old.len(), "Reloading workers");
                self.fill().await?;
                for pid in old.into_iter().flatten() {
                    send_signal(pid, Signal::SIGTERM);
                }
            }
            Control::IncreaseWorkers => {
                self.target += 1;
                tracing::info!(target = self.target, "Increasing workers");
                self.fill().await?;
            }
            Control::DecreaseWorkers => {
                if self.target <= 1 {
                    tracing::info!("Keeping the last worker");
                    return Ok(());
                }
                self.target -= 1;
                tracing::info!(target = self.target, "Decreasing workers");
                if let Some(slot) = self.workers.values_mut().find(|w| !w.retiring) {
                    slot.retiring = true;
                    if let Some(pid) = slot.pid {
                        send_signal(pid, Signal::SIGTERM);
                    }
                }
            }
        }
        Ok(())
    }

    fn signal_all(&self, signal: Signal) -> usize {
        self.workers
            .values()
            .filter_map(|w| w.pid)
            .filter(|pid| send_signal(*pid, signal))
            .count()
    }

    /// Close the listener, ask workers to finish, force-kill stragglers.
    async fn drain(mut self) -> StevedoreResult<ExitReport> {
        self.transition(SupervisorState::Draining)?;
        self.respawn_at = None;
        drop(self.listener.take());

        let grace = self.spec.graceful_timeout;
        tracing::info!(workers = self.workers.len(), grace = ?grace, "Draining");
        self.signal_all(Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        let mut forced_kills = 0;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok((id, status)))) => {
                    self.workers.remove(&id);
                    tracing::debug!(worker = id, status = ?status, "Worker stopped");
                    self.publish();
                }
                Ok(Some(Err(e))) => tracing::warn!(error = %e, "Worker wait task failed"),
                Ok(None) => break,
                Err(_) => {
                    forced_kills = self.signal_all(Signal::SIGKILL);
                    tracing::warn!(forced_kills, "Grace period expired, killing workers");
                    while let Some(joined) = self.tasks.join_next().await {
                        if let Ok((id, _)) = joined {
                            self.workers.remove(&id);
                        }
                    }
                    break;
                }
            }
        }

        self.workers.clear();
        self.transition(SupervisorState::Stopped)?;
        tracing::info!(restarts = self.restarts, "Stopped");
        Ok(ExitReport {
            restarts: self.restarts,
            forced_kills,
        })
    }

    /// Fatal stop: kill everything and mark the master crashed.
    async fn halt(&mut self) -> StevedoreResult<()> {
        drop(self.listener.take());
        self.respawn_at = None;
        self.signal_all(Signal::SIGKILL);
        self.tasks.shutdown().await;
        self.workers.clear();
        self.transition(SupervisorState::Crashed)
    }
}
