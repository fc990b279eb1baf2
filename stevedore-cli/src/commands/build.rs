use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use stevedore::build::executor_for;
use stevedore::constants::build as build_defaults;
use stevedore::{BuildOptions, Builder, Isolation, Recipe};

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Recipe file (defaults to <context>/Containerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Name and optional tag of the image (name:tag)
    #[arg(short = 't', long = "tag", required = true)]
    pub tag: String,

    /// How RUN steps are isolated: host or chroot
    #[arg(long, default_value = "chroot")]
    pub isolation: Isolation,

    /// Fail the build on lint warnings
    #[arg(long)]
    pub strict: bool,

    /// Execute every step, ignoring the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Wall clock limit per RUN step, in seconds
    #[arg(long, value_name = "SECS")]
    pub step_timeout: Option<u64>,

    /// Dependency manifest, relative to the context
    #[arg(long, default_value = build_defaults::DEFAULT_MANIFEST)]
    pub manifest: PathBuf,
}

pub async fn execute(args: BuildArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let recipe_path = args
        .file
        .clone()
        .unwrap_or_else(|| args.context.join(build_defaults::DEFAULT_RECIPE));
    let recipe = Recipe::load(&recipe_path)?;

    let options = BuildOptions {
        strict: args.strict,
        step_timeout: args.step_timeout.map(Duration::from_secs),
        manifest: args.manifest,
        no_cache: args.no_cache,
    };
    let builder = Builder::new(
        global.open_store()?,
        global.base_images(),
        executor_for(args.isolation),
        options,
    );

    let report = builder.build(&recipe, &args.context, &args.tag).await?;

    let total = report.steps.len();
    for step in &report.steps {
        let marker = if step.cached { " (cached)" } else { "" };
        println!("Step {}/{} : {}{}", step.index, total, step.instruction, marker);
    }
    println!(
        "Successfully built {} {} ({} of {} steps cached)",
        report.image.short_id(),
        report.image.tag,
        report.cached_count(),
        total
    );
    Ok(())
}
