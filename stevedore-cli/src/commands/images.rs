use clap::Args;
use comfy_table::{Table, presets::NOTHING};

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Only show image IDs
    #[arg(short, long)]
    pub quiet: bool,
}

pub fn execute(args: ImagesArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let store = global.open_store()?;
    let images = store.list();

    if args.quiet {
        for image in images {
            println!("{}", image.short_id());
        }
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["TAG", "IMAGE ID", "BASE", "LAYERS", "DEPENDENCIES", "CREATED"]);

    for image in images {
        table.add_row(vec![
            image.tag.clone(),
            image.short_id().to_string(),
            image.base.reference.to_string(),
            image.layers.len().to_string(),
            image.dependencies.len().to_string(),
            format_created(&image.created_at),
        ]);
    }

    println!("{table}");
    Ok(())
}

fn format_created(created_at: &chrono::DateTime<chrono::Utc>) -> String {
    let age = chrono::Utc::now().signed_duration_since(*created_at);
    if age.num_days() > 0 {
        format!("{} days ago", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{} hours ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{} minutes ago", age.num_minutes())
    } else {
        "Less than a minute ago".to_string()
    }
}
