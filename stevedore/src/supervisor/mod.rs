//! Process supervisor: a master that validates the application, owns the
//! listening socket and keeps a set of ASGI worker processes alive.

pub mod app;
pub mod bind;
pub mod fd;
mod master;
pub mod probe;
pub mod spec;
pub mod state;
pub mod worker;

pub use app::AppRef;
pub use bind::BindAddress;
pub use master::{Control, ExitReport, Snapshot, Supervisor, SupervisorControl, SupervisorHandle};
pub use probe::{AppProbe, PythonImportProbe};
pub use spec::{SupervisionSpec, resolve_worker_count};
pub use state::SupervisorState;
pub use worker::{AsgiLauncher, LaunchContext, WorkerClass, WorkerLauncher, spawn_worker};
