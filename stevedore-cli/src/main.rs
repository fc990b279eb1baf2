//! stevedore CLI
//!
//! Usage: stevedore [--home DIR] <COMMAND>
//!
//! Commands:
//!   init     Write the canonical Containerfile for a Python ASGI service
//!   check    Validate and lint a recipe without building
//!   build    Build an image from a recipe and a context directory
//!   images   List images
//!   inspect  Show an image record as JSON
//!   rmi      Remove image records
//!   export   Materialise an image root filesystem into a directory
//!   serve    Validate the app, bind the port and supervise workers

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use stevedore::StevedoreError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = cli.global.init_logging(&cli.command);

    let result = match cli.command {
        Commands::Init(args) => commands::init::execute(args),
        Commands::Check(args) => commands::check::execute(args),
        Commands::Build(args) => commands::build::execute(args, &cli.global).await,
        Commands::Images(args) => commands::images::execute(args, &cli.global),
        Commands::Inspect(args) => commands::inspect::execute(args, &cli.global),
        Commands::Rmi(args) => commands::rmi::execute(args, &cli.global),
        Commands::Export(args) => commands::export::execute(args, &cli.global).await,
        Commands::Serve(args) => commands::serve::execute(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Typed library errors keep their own exit status; everything else is 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<StevedoreError>()
        .map(StevedoreError::exit_code)
        .unwrap_or(1)
}
