//! TenderScout CLI: price research for public tender items.
//!
//! Runs the investigative pipeline for one item or a batch file and
//! manages the identity cache and configuration.

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
