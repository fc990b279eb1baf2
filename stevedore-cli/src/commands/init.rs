use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stevedore::build::PythonServiceRecipe;
use stevedore::constants::{build as build_defaults, network, supervisor as supervisor_defaults};
use stevedore::supervisor::{AppRef, WorkerClass};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project directory to write the Containerfile into
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Python version of the `python:<version>-slim` base image
    #[arg(long, default_value = build_defaults::DEFAULT_PYTHON_VERSION)]
    pub python_version: String,

    /// Port the image exposes and the service binds
    #[arg(long, default_value_t = network::DEFAULT_PORT)]
    pub port: u16,

    /// Application as module:attribute
    #[arg(long, default_value = "app.main:app")]
    pub app: AppRef,

    /// Worker class of the image command
    #[arg(short = 'k', long, default_value = "uvicorn.workers.UvicornWorker")]
    pub worker_class: WorkerClass,

    /// Program the image command starts (e.g. "stevedore serve")
    #[arg(long, default_value = supervisor_defaults::DEFAULT_PROGRAM)]
    pub program: String,

    /// OS packages installed before the Python dependencies (none skips the step)
    #[arg(long = "system-package", default_values_t = vec!["build-essential".to_string()])]
    pub system_packages: Vec<String>,

    /// Overwrite an existing Containerfile
    #[arg(long)]
    pub force: bool,
}

pub fn execute(args: InitArgs) -> anyhow::Result<()> {
    let recipe = PythonServiceRecipe {
        python_version: args.python_version,
        port: args.port,
        app: args.app,
        worker_class: args.worker_class,
        program: args.program,
        system_packages: args
            .system_packages
            .into_iter()
            .filter(|p| !p.is_empty() && p != "none")
            .collect(),
        ..Default::default()
    };
    let text = recipe.render()?;

    std::fs::create_dir_all(&args.dir)
        .with_context(|| format!("Failed to create {}", args.dir.display()))?;

    let path = args.dir.join(build_defaults::DEFAULT_RECIPE);
    if path.exists() && !args.force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{}", path.display());

    let manifest = args.dir.join(&recipe.manifest);
    if !manifest.exists() {
        std::fs::write(&manifest, "")
            .with_context(|| format!("Failed to write {}", manifest.display()))?;
        println!("{}", manifest.display());
    }
    Ok(())
}
