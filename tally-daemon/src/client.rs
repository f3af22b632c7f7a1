//! Blocking HTTP client for a running daemon, used by `tally daemon status|sync`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tally_core::ServerSettings;
use tally_sync::SyncReport;

use crate::error::DaemonError;
use crate::protocol::{ErrorBody, SyncStatus, SYNC_PATH};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// `http://host:port` for the configured bind address. A wildcard bind is
/// reached through loopback.
pub fn base_url(server: &ServerSettings) -> String {
    match server.bind.parse::<SocketAddr>() {
        Ok(mut addr) => {
            if addr.ip().is_unspecified() {
                let loopback: IpAddr = match addr {
                    SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                    SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
                };
                addr.set_ip(loopback);
            }
            format!("http://{addr}")
        }
        Err(_) => format!("http://{}", server.bind),
    }
}

/// `GET /api/sync`.
pub fn request_status(base_url: &str) -> Result<SyncStatus, DaemonError> {
    let url = format!("{}{SYNC_PATH}", base_url.trim_end_matches('/'));
    let response = agent()
        .get(&url)
        .call()
        .map_err(|err| map_error(&url, err))?;
    response
        .into_json()
        .map_err(|err| DaemonError::Protocol(format!("invalid status body: {err}")))
}

/// `POST /api/sync`; blocks until the run finishes.
pub fn request_sync(base_url: &str, secret: Option<&str>) -> Result<SyncReport, DaemonError> {
    let url = format!("{}{SYNC_PATH}", base_url.trim_end_matches('/'));
    let mut request = agent().post(&url);
    if let Some(secret) = secret {
        request = request.set("Authorization", &format!("Bearer {secret}"));
    }
    let response = request.call().map_err(|err| map_error(&url, err))?;
    response
        .into_json()
        .map_err(|err| DaemonError::Protocol(format!("invalid sync body: {err}")))
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .build()
}

fn map_error(url: &str, err: ureq::Error) -> DaemonError {
    match err {
        ureq::Error::Status(401, _) => DaemonError::Unauthorized,
        ureq::Error::Status(409, _) => DaemonError::SyncInProgress,
        ureq::Error::Status(code, response) => {
            let message = response
                .into_json::<ErrorBody>()
                .map(|body| body.error)
                .unwrap_or_else(|_| "no error body".to_string());
            DaemonError::Protocol(format!("daemon returned HTTP {code}: {message}"))
        }
        ureq::Error::Transport(_) => DaemonError::DaemonNotRunning {
            url: url.to_string(),
        },
    }
}
