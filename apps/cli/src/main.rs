//! eventstream-router: routes live recent-changes events to pluggable
//! handlers.
//!
//! Subscribes to the event feed, resumes from the last checkpoint, and keeps
//! running until interrupted.

mod alert;
mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
