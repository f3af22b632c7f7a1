//! `tally init [--force]`

use anyhow::{Context, Result};
use clap::Args;

use tally_core::config;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config with the defaults.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let path = config::config_path_at(&home);
        let (_, created) = config::init_at(&home, self.force)
            .with_context(|| format!("failed to write {}", path.display()))?;

        if created {
            println!("✓ Wrote default config to {}", path.display());
            println!("  Set source.spreadsheet_id (or switch source.kind to csv) before syncing.");
        } else {
            println!("Config already exists at {}; use --force to overwrite.", path.display());
        }
        Ok(())
    }
}
