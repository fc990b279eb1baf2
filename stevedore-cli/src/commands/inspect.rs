use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Image tag(s)
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,
}

pub fn execute(args: InspectArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let store = global.open_store()?;

    let mut records = Vec::with_capacity(args.targets.len());
    for target in &args.targets {
        match store.get(target) {
            Some(record) => records.push(record),
            None => anyhow::bail!("No such image: {}", target),
        }
    }

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
