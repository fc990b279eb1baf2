use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct RmiArgs {
    /// Image tag(s) to remove
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,
}

pub fn execute(args: RmiArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let store = global.open_store()?;

    let mut errors = Vec::new();
    for target in args.targets {
        match store.remove(&target) {
            Ok(record) => println!("Untagged: {} ({})", record.tag, record.short_id()),
            Err(e) => {
                eprintln!("Error removing image '{}': {}", target, e);
                errors.push(target);
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Failed to remove {} image(s): {}", errors.len(), errors.join(", "));
    }
    Ok(())
}
