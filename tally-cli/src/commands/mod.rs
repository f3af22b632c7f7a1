pub mod daemon;
pub mod init;
pub mod runs;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};

use tally_core::{config, RunStatus, TallyConfig};

/// Home directory and the config loaded from it.
pub(crate) fn load_config() -> Result<(PathBuf, TallyConfig)> {
    let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
    let config = config::load_at(&home).context("failed to load tally config")?;
    Ok((home, config))
}

pub(crate) fn status_label(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Running => status.as_str().yellow(),
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Failed => status.as_str().red(),
    }
}

/// "just now", "5m ago", "3h ago", "2d ago".
pub(crate) fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(at).num_seconds().max(0);
    match secs {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
