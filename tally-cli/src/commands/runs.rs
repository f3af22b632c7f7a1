//! `tally runs` — recent ledger entries, newest first.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use tally_core::SyncRun;
use tally_sync::pipeline;

use super::{format_age, load_config, status_label};

#[derive(Args, Debug)]
pub struct RunsArgs {
    /// Maximum number of runs to show.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "run")]
    id: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "started")]
    started: String,
    #[tabled(rename = "duration")]
    duration: String,
    #[tabled(rename = "total")]
    total: usize,
    #[tabled(rename = "ins")]
    inserted: usize,
    #[tabled(rename = "upd")]
    updated: usize,
    #[tabled(rename = "del")]
    deleted: usize,
    #[tabled(rename = "error")]
    error: String,
}

impl RunsArgs {
    pub fn run(self) -> Result<()> {
        let (home, config) = load_config()?;
        let runs = pipeline::recent_runs(&config, &home, self.limit)
            .context("failed to read the run ledger")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&runs).context("failed to serialize runs JSON")?
            );
            return Ok(());
        }

        if runs.is_empty() {
            println!("No sync runs recorded.");
            return Ok(());
        }

        let now = Utc::now();
        let rows: Vec<RunRow> = runs.iter().map(|run| to_row(run, now)).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn to_row(run: &SyncRun, now: chrono::DateTime<Utc>) -> RunRow {
    let duration = run
        .completed_at
        .map(|done| {
            let ms = done.signed_duration_since(run.started_at).num_milliseconds().max(0);
            format!("{:.1}s", ms as f64 / 1000.0)
        })
        .unwrap_or_else(|| "-".to_string());
    RunRow {
        id: format!("#{}", run.id),
        status: status_label(run.status).to_string(),
        started: format_age(run.started_at, now),
        duration,
        total: run.counts.total_rows,
        inserted: run.counts.inserted_rows,
        updated: run.counts.updated_rows,
        deleted: run.counts.deleted_rows,
        error: run.error_message.clone().unwrap_or_default(),
    }
}
