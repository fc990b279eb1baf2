//! stevedore: build a layer-cached runtime image for a Python ASGI service
//! and supervise its worker processes at start.
//!
//! Two independent halves share nothing but the image record:
//! - [`build`]: turns a base image, a dependency manifest and a source tree
//!   into an ordered stack of content-addressed layers
//! - [`supervisor`]: validates the application, binds the port once and
//!   keeps worker processes alive until told to stop

pub mod build;
pub mod env;
pub mod images;
pub mod runtime;
pub mod supervisor;
pub mod util;

pub use build::{BuildReport, Builder, PythonServiceRecipe, Recipe};
pub use env::EnvSet;
pub use images::{ImageRecord, ImageStore, LocalBaseImages};
pub use runtime::{BuildOptions, FilesystemLayout, Isolation, StevedoreOptions};
pub use supervisor::{SupervisionSpec, Supervisor, SupervisorHandle, WorkerClass};

pub use stevedore_shared::{
    BuildError, StevedoreError, StevedoreResult, SupervisorError, constants,
};
