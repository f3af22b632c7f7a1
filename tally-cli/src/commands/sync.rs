//! `tally sync` — one foreground reconciliation run.

use anyhow::{Context, Result};
use clap::Args;

use tally_daemon::init_tracing;
use tally_sync::{pipeline, CancelFlag, SyncReport};

use super::load_config;

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Emit the run report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let (home, config) = load_config()?;
        init_tracing(&config.logging);

        let report = pipeline::run(&config, &home, CancelFlag::new()).context("sync failed")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize sync report")?
            );
        } else {
            print_report(&report);
        }
        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    let counts = &report.counts;
    if counts.is_noop() {
        println!(
            "✓ run #{} — {} rows, nothing changed",
            report.run_id, counts.total_rows
        );
        return;
    }
    println!(
        "✓ run #{} — {} rows: {} inserted, {} updated, {} deleted",
        report.run_id,
        counts.total_rows,
        counts.inserted_rows,
        counts.updated_rows,
        counts.deleted_rows,
    );
}
