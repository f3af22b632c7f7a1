//! `tally status` — the most recent ledger entry.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;

use tally_core::{RunStatus, SyncRun};
use tally_daemon::SyncStatus;
use tally_sync::pipeline;

use super::{format_age, load_config, status_label};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let (home, config) = load_config()?;
        let last_run = pipeline::last_run(&config, &home).context("failed to read the run ledger")?;

        // Without a daemon to ask, the ledger is the only signal.
        let status = SyncStatus {
            sync_in_progress: last_run
                .as_ref()
                .is_some_and(|run| run.status == RunStatus::Running),
            last_run,
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        match status.last_run {
            Some(run) => print_run(&run),
            None => println!("No sync has run yet. Run `tally sync` to start one."),
        }
        Ok(())
    }
}

fn print_run(run: &SyncRun) {
    println!(
        "Last run #{} {} (started {})",
        run.id,
        status_label(run.status).bold(),
        format_age(run.started_at, Utc::now()),
    );
    match run.status {
        RunStatus::Completed => println!(
            "  {} rows | {} inserted | {} updated | {} deleted",
            run.counts.total_rows,
            run.counts.inserted_rows,
            run.counts.updated_rows,
            run.counts.deleted_rows,
        ),
        RunStatus::Failed => {
            if let Some(message) = &run.error_message {
                println!("  error: {}", message.red());
            }
        }
        RunStatus::Running => println!("  in progress"),
    }
}
