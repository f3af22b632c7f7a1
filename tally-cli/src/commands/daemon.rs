//! `tally daemon` — run the sync service or talk to a running one.

use anyhow::{Context, Result};
use clap::Subcommand;

use tally_daemon::{base_url, request_status, request_sync, start_blocking, DaemonError};

use super::load_config;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the scheduler and HTTP trigger in the foreground.
    Start,
    /// Ask a running daemon for its last run.
    Status,
    /// Ask a running daemon to sync now and wait for the result.
    Sync,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Start => {
            let home = dirs::home_dir().context("could not determine home directory")?;
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Status => {
            let (_, config) = load_config()?;
            let url = base_url(&config.server);
            match request_status(&url) {
                Ok(status) => {
                    let payload = serde_json::json!({
                        "running": true,
                        "url": url,
                        "lastRun": status.last_run,
                        "syncInProgress": status.sync_in_progress,
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&payload)
                            .context("failed to render daemon status JSON")?
                    );
                }
                Err(DaemonError::DaemonNotRunning { url }) => {
                    let payload = serde_json::json!({ "running": false, "url": url });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&payload)
                            .context("failed to render daemon status JSON")?
                    );
                }
                Err(err) => return Err(err).context("failed to query daemon status"),
            }
        }
        DaemonCommand::Sync => {
            let (_, config) = load_config()?;
            let url = base_url(&config.server);
            let secret = config.server.secret();
            let report = request_sync(&url, secret.as_deref()).context("daemon sync failed")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render sync report")?
            );
        }
    }

    Ok(())
}
