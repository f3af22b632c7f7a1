//! Tally — spreadsheet-to-ledger sync CLI.
//!
//! # Usage
//!
//! ```text
//! tally init [--force]
//! tally sync [--json]
//! tally status [--json]
//! tally runs [--limit N] [--json]
//! tally daemon start|status|sync
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, init::InitArgs, runs::RunsArgs, status::StatusArgs, sync::SyncArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    version,
    about = "Mirror an expense spreadsheet into a local SQLite ledger",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default ~/.tally/config.yaml.
    Init(InitArgs),

    /// Run one sync in the foreground.
    Sync(SyncArgs),

    /// Show the most recent sync run.
    Status(StatusArgs),

    /// List recent sync runs.
    Runs(RunsArgs),

    /// Run or talk to the background sync service.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Runs(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
