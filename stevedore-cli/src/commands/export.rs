use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Image tag
    pub tag: String,

    /// Destination directory (must be empty or absent)
    pub dest: PathBuf,
}

pub async fn execute(args: ExportArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    if args.dest.exists()
        && std::fs::read_dir(&args.dest)
            .with_context(|| format!("Failed to read {}", args.dest.display()))?
            .next()
            .is_some()
    {
        anyhow::bail!("{} is not empty", args.dest.display());
    }

    let store = global.open_store()?;
    let bases = global.base_images();
    let ExportArgs { tag, dest } = args;
    let record = tokio::task::spawn_blocking({
        let dest = dest.clone();
        move || store.export(&tag, &dest, bases.as_ref())
    })
    .await??;

    println!("{} -> {}", record.tag, dest.display());
    Ok(())
}
