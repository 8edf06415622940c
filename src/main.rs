//! egress-proxy: Egress-control proxy for sandboxed AI agents
//!
//! This is the main entry point for the egress-proxy binary. It handles CLI
//! argument parsing and logging initialization, then dispatches to the
//! selected subcommand.
//!
//! # I/O
//!
//! - **Logs**: `tracing` output goes to stderr, filtered by `-v` or `RUST_LOG`
//! - **Command output**: client subcommands and `issue-credentials` print
//!   to stdout so their output can be piped or `eval`ed

use anyhow::{Context, Result};
use clap::Parser;
use egress_warden::{cli::Cli, cli_handler::handle_command};
use tracing::debug;

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    handle_command(cli.command)
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG` if set, otherwise warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
