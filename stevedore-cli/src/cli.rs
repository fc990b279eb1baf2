use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use stevedore::util::{env_filter, register_to_tracing};
use tracing_appender::non_blocking::WorkerGuard;
use stevedore::{FilesystemLayout, ImageStore, LocalBaseImages, StevedoreOptions};

use crate::commands;

/// stevedore - layer-cached image builder and ASGI process supervisor
#[derive(Parser, Debug)]
#[command(name = "stevedore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the canonical Containerfile for a Python ASGI service
    Init(commands::init::InitArgs),

    /// Validate and lint a recipe without building
    Check(commands::check::CheckArgs),

    /// Build an image from a recipe and a context directory
    Build(commands::build::BuildArgs),

    /// List images
    Images(commands::images::ImagesArgs),

    /// Show an image record as JSON
    Inspect(commands::inspect::InspectArgs),

    /// Remove image records (layers stay cached)
    Rmi(commands::rmi::RmiArgs),

    /// Materialise an image root filesystem into a directory
    Export(commands::export::ExportArgs),

    /// Validate the app, bind the port and supervise workers
    Serve(commands::serve::ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Store directory (defaults to ~/.stevedore)
    #[arg(long, global = true, env = "STEVEDORE_HOME")]
    pub home: Option<PathBuf>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

impl GlobalFlags {
    /// Install logging. Builds also keep a log under the store when no
    /// `--log-dir` is given.
    pub fn init_logging(&self, command: &Commands) -> Option<WorkerGuard> {
        let log_dir = self.log_dir.clone().or_else(|| {
            matches!(command, Commands::Build(_)).then(|| self.layout().logs_dir())
        });
        let log_dir = log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok());
        register_to_tracing(env_filter("info"), log_dir.as_deref(), "stevedore")
    }

    pub fn options(&self) -> StevedoreOptions {
        match &self.home {
            Some(home) => StevedoreOptions {
                home_dir: home.clone(),
            },
            None => StevedoreOptions::default(),
        }
    }

    pub fn layout(&self) -> FilesystemLayout {
        FilesystemLayout::new(self.options().home_dir)
    }

    pub fn open_store(&self) -> anyhow::Result<Arc<ImageStore>> {
        Ok(Arc::new(ImageStore::open(self.layout())?))
    }

    pub fn base_images(&self) -> Arc<LocalBaseImages> {
        Arc::new(LocalBaseImages::new(self.layout().bases_dir()))
    }
}
