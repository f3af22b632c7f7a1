//! YAML configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.tally/
//!   config.yaml   (mode 0600)
//!   tally.db      (default database location)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Secrets never live in the file. The config names the environment
//! variables that hold them.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::headers::{CanonicalField, HeaderTable};

pub const TALLY_DIR: &str = ".tally";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DATABASE_FILE: &str = "tally.db";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Root of `~/.tally/config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Database file. Relative paths resolve against `~/.tally/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Per-field replacements for the built-in header table.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<CanonicalField, Vec<String>>,
}

/// Where rows come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Google Sheets v4 `values.get`.
    GoogleSheets {
        spreadsheet_id: String,
        #[serde(default = "default_range")]
        range: String,
        /// Env var holding an OAuth access token (sent as a bearer token).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token_env: Option<String>,
        /// Env var holding an API key (for link-shared sheets).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    /// A CSV export of the sheet; the first record is the header row.
    Csv { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Rows per insert/update chunk.
    pub batch_size: usize,
    /// A `running` ledger entry younger than this blocks a new run.
    pub lease_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub run_on_start: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    /// Env var holding the bearer secret for `POST /api/sync`. Unset or empty
    /// variable means the endpoint is open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

fn default_range() -> String {
    "Sheet1".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            lease_minutes: 120,
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
            run_on_start: false,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            secret_env: Some("TALLY_SYNC_SECRET".to_string()),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            database: None,
            source: SourceConfig::GoogleSheets {
                spreadsheet_id: String::new(),
                range: default_range(),
                access_token_env: Some("TALLY_SHEETS_TOKEN".to_string()),
                api_key_env: Some("TALLY_SHEETS_API_KEY".to_string()),
                timeout_secs: default_timeout_secs(),
            },
            sync: SyncSettings::default(),
            schedule: ScheduleSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
            headers: BTreeMap::new(),
        }
    }
}

impl TallyConfig {
    /// Absolute database path for `home`.
    pub fn database_path(&self, home: &Path) -> PathBuf {
        match &self.database {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => tally_dir_at(home).join(path),
            None => tally_dir_at(home).join(DATABASE_FILE),
        }
    }

    /// Built-in header table with this config's overrides applied.
    pub fn header_table(&self) -> HeaderTable {
        HeaderTable::with_overrides(&self.headers)
    }

    /// Check values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.schedule.interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                field: "schedule.interval_minutes",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Err(err) = self.server.bind.parse::<SocketAddr>() {
            return Err(ConfigError::Invalid {
                field: "server.bind",
                reason: format!("'{}' is not a socket address: {err}", self.server.bind),
            });
        }
        for (field, texts) in &self.headers {
            if texts.iter().all(|t| t.trim().is_empty()) {
                return Err(ConfigError::Invalid {
                    field: "headers",
                    reason: format!("no header text given for '{field}'"),
                });
            }
        }
        Ok(())
    }
}

impl ServerSettings {
    /// The bearer secret, if its env var is set and non-empty.
    pub fn secret(&self) -> Option<String> {
        let var = self.secret_env.as_deref()?;
        std::env::var(var).ok().filter(|s| !s.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.tally/` — pure, no I/O.
pub fn tally_dir_at(home: &Path) -> PathBuf {
    home.join(TALLY_DIR)
}

/// `<home>/.tally/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    tally_dir_at(home).join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Load / save / init
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.tally/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<TallyConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: TallyConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<TallyConfig, ConfigError> {
    load_at(&home()?)
}

/// Atomically save `config` to `<home>/.tally/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &TallyConfig) -> Result<(), ConfigError> {
    ensure_tally_dir_at(home)?;
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &TallyConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

/// Write a default config unless one exists (or `force` is set).
///
/// Returns the config on disk and whether it was freshly written. An
/// existing file is returned as parsed, without validation, so a half-edited
/// config can still be inspected.
pub fn init_at(home: &Path, force: bool) -> Result<(TallyConfig, bool), ConfigError> {
    let path = config_path_at(home);
    if path.exists() && !force {
        let contents = std::fs::read_to_string(&path)?;
        let config =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
        return Ok((config, false));
    }
    let config = TallyConfig::default();
    save_at(home, &config)?;
    Ok((config, true))
}

/// `init_at` convenience wrapper.
pub fn init(force: bool) -> Result<(TallyConfig, bool), ConfigError> {
    init_at(&home()?, force)
}

/// Resolve the user's home directory.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn ensure_tally_dir_at(home: &Path) -> Result<PathBuf, ConfigError> {
    let dir = tally_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
