use std::path::PathBuf;

use clap::Args;
use stevedore::build::{DependencyManifest, Recipe, lint};
use stevedore::constants::build as build_defaults;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Recipe file (defaults to <context>/Containerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Treat lint warnings as errors
    #[arg(long)]
    pub strict: bool,
}

pub fn execute(args: CheckArgs) -> anyhow::Result<()> {
    let path = args
        .file
        .unwrap_or_else(|| args.context.join(build_defaults::DEFAULT_RECIPE));
    let recipe = Recipe::load(&path)?;
    recipe.validate()?;

    let manifest_path = args.context.join(build_defaults::DEFAULT_MANIFEST);
    if manifest_path.is_file() {
        let manifest = DependencyManifest::load(&manifest_path)?;
        let unpinned: Vec<_> = manifest
            .requirements
            .iter()
            .filter(|r| !r.is_pinned())
            .map(|r| r.name.as_str())
            .collect();
        println!(
            "{}: {} requirement(s), {} unpinned",
            manifest_path.display(),
            manifest.len(),
            unpinned.len()
        );
    }

    let warnings = lint::check(&recipe);
    for warning in &warnings {
        println!("warning: {warning}");
    }
    if args.strict && !warnings.is_empty() {
        anyhow::bail!("{} lint warning(s)", warnings.len());
    }

    println!("{}: {} step(s) OK", path.display(), recipe.len());
    Ok(())
}
