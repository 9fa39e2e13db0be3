//! mayhemctl - operator CLI for a running mayhem proxy.
//!
//! Talks to the control API to list behaviors, read the active one and
//! switch it at runtime.

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;
mod error;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
