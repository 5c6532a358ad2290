//! PieceStream CLI - Command-line interface
//!
//! Resolves torrents, checks swarm health and runs simulated streams.

mod commands;

use anyhow::Context;
use clap::Parser;
use piecestream_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "piecestream")]
#[command(about = "Stream video files out of BitTorrent swarms")]
struct Cli {
    /// Console log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    /// Directory for the per-run debug log
    #[arg(long)]
    logs_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("failed to set up logging")?;

    if let Err(error) = commands::handle_command(cli.command).await {
        tracing::error!("Command failed: {}", error);
        eprintln!("error: {}", error.user_message());
        std::process::exit(if error.is_user_error() { 2 } else { 1 });
    }

    Ok(())
}
