//! HTTP wire shapes shared by the server and the client.

use serde::{Deserialize, Serialize};

use tally_core::SyncRun;

pub const SYNC_PATH: &str = "/api/sync";
pub const HEALTH_PATH: &str = "/healthz";

/// Body of `GET /api/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_run: Option<SyncRun>,
    pub sync_in_progress: bool,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
