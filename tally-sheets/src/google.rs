//! Google Sheets v4 `values.get` adapter.
//!
//! One GET per fetch, bounded by the agent timeout. The first returned row is
//! the header row. Cells come back as formatted strings; anything else is
//! stringified so the fingerprint always sees sheet text.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::{SheetData, SheetSource, SourceError};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// How requests authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// OAuth access token, sent as `Authorization: Bearer`.
    AccessToken(String),
    /// API key, sent as the `key` query parameter.
    ApiKey(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::AccessToken(_) => f.write_str("AccessToken(***)"),
            Credential::ApiKey(_) => f.write_str("ApiKey(***)"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug)]
pub struct GoogleSheetsSource {
    agent: ureq::Agent,
    base_url: String,
    spreadsheet_id: String,
    range: String,
    credential: Credential,
}

impl GoogleSheetsSource {
    pub fn new(
        spreadsheet_id: impl Into<String>,
        range: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: SHEETS_API_BASE.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            range: range.into(),
            credential,
        }
    }

    /// Resolve the credential from the named env vars; the access token wins
    /// when both are set.
    pub fn from_env(
        spreadsheet_id: &str,
        range: &str,
        access_token_env: Option<&str>,
        api_key_env: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        if spreadsheet_id.trim().is_empty() {
            return Err(SourceError::InvalidConfig(
                "source.spreadsheet_id must not be empty".to_string(),
            ));
        }

        let read = |name: Option<&str>| {
            name.and_then(|var| std::env::var(var).ok())
                .filter(|value| !value.trim().is_empty())
        };
        let credential = if let Some(token) = read(access_token_env) {
            Credential::AccessToken(token)
        } else if let Some(key) = read(api_key_env) {
            Credential::ApiKey(key)
        } else {
            let names: Vec<&str> = [access_token_env, api_key_env].into_iter().flatten().collect();
            return Err(SourceError::MissingCredential(if names.is_empty() {
                "access_token_env or api_key_env in config.yaml".to_string()
            } else {
                names.join(", ")
            }));
        };

        Ok(Self::new(spreadsheet_id, range, credential, timeout))
    }

    /// Point the adapter at a different API root (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `{base}/{spreadsheet_id}/values/{range}`, each segment percent-encoded.
    pub fn values_url(&self) -> Result<Url, SourceError> {
        let invalid = |reason: String| {
            SourceError::InvalidConfig(format!("sheets API base {}: {reason}", self.base_url))
        };
        let mut url = Url::parse(&self.base_url).map_err(|err| invalid(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("cannot be a base URL".to_string()))?
            .pop_if_empty()
            .push(&self.spreadsheet_id)
            .push("values")
            .push(&self.range);
        Ok(url)
    }
}

impl SheetSource for GoogleSheetsSource {
    fn fetch(&self) -> Result<SheetData, SourceError> {
        let url = self.values_url()?;
        let mut request = self
            .agent
            .request_url("GET", &url)
            .query("majorDimension", "ROWS")
            .query("valueRenderOption", "FORMATTED_VALUE");
        request = match &self.credential {
            Credential::AccessToken(token) => {
                request.set("Authorization", &format!("Bearer {token}"))
            }
            Credential::ApiKey(key) => request.query("key", key),
        };

        let response = request.call().map_err(map_ureq_error)?;
        let body: ValueRange = response
            .into_json()
            .map_err(|err| SourceError::Decode(err.to_string()))?;

        let values: Vec<Vec<String>> = body
            .values
            .into_iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();
        tracing::debug!(
            spreadsheet = %self.spreadsheet_id,
            range = %self.range,
            rows = values.len(),
            "fetched sheet values",
        );
        Ok(SheetData::from_values(values))
    }

    fn describe(&self) -> String {
        format!("google-sheets:{}/{}", self.spreadsheet_id, self.range)
    }
}

fn map_ureq_error(err: ureq::Error) -> SourceError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            SourceError::Status {
                status,
                message: api_error_message(&body),
            }
        }
        ureq::Error::Transport(transport) => SourceError::Transport(transport.to_string()),
    }
}

/// Pull `error.message` out of a Google error body, or fall back to the raw text.
fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

pub(crate) fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn source(range: &str) -> GoogleSheetsSource {
        GoogleSheetsSource::new(
            "sheet-id",
            range,
            Credential::ApiKey("k".to_string()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn values_url_encodes_sheet_names() {
        let url = source("ค่าใช้จ่าย 2567!A1:Z").values_url().unwrap();
        let url = url.as_str();
        assert!(url.starts_with(SHEETS_API_BASE));
        assert!(url.ends_with("!A1:Z"));
        assert!(!url.contains(' '));
        assert!(url.contains("%20"));
        assert!(url.contains("/sheet-id/values/%E0%B8%84"));
    }

    #[test]
    fn range_slashes_stay_inside_one_segment() {
        let url = source("a/b?c#d").values_url().unwrap();
        assert!(url.as_str().ends_with("/values/a%2Fb%3Fc%23d"), "got: {url}");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn base_url_override_drops_trailing_slash() {
        let url = source("Sheet1").with_base_url("http://127.0.0.1:9/").values_url().unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9/sheet-id/values/Sheet1");
    }

    #[test]
    fn unparsable_base_url_is_a_config_error() {
        let err = source("Sheet1").with_base_url("not a url").values_url().unwrap_err();
        assert!(matches!(err, SourceError::InvalidConfig(_)), "got: {err}");
    }

    #[rstest]
    #[case(json!("abc"), "abc")]
    #[case(json!(12.5), "12.5")]
    #[case(json!(7), "7")]
    #[case(json!(true), "true")]
    #[case(Value::Null, "")]
    fn non_string_cells_are_stringified(#[case] cell: Value, #[case] expected: &str) {
        assert_eq!(cell_to_string(&cell), expected);
    }

    #[test]
    fn google_error_body_message_is_extracted() {
        let body = r#"{"error":{"code":403,"message":"The caller does not have permission","status":"PERMISSION_DENIED"}}"#;
        assert_eq!(api_error_message(body), "The caller does not have permission");
        assert_eq!(api_error_message("<html>bad gateway</html>"), "<html>bad gateway</html>");
        assert_eq!(api_error_message(""), "empty response body");
    }

    #[test]
    fn missing_credentials_name_the_env_vars() {
        let err = GoogleSheetsSource::from_env(
            "sheet-id",
            "Sheet1",
            Some("TALLY_TEST_UNSET_TOKEN_VAR"),
            Some("TALLY_TEST_UNSET_KEY_VAR"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("TALLY_TEST_UNSET_TOKEN_VAR"));
        assert!(message.contains("TALLY_TEST_UNSET_KEY_VAR"));
    }

    #[test]
    fn empty_spreadsheet_id_is_rejected() {
        let err = GoogleSheetsSource::from_env("  ", "Sheet1", None, None, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidConfig(_)));
    }

    #[test]
    fn credential_debug_hides_secrets() {
        let debug = format!("{:?}", Credential::AccessToken("ya29.secret".to_string()));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn unreachable_host_is_a_transport_error() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let source = source("Sheet1").with_base_url(&format!("http://{addr}"));
        let err = source.fetch().unwrap_err();
        assert!(matches!(err, SourceError::Transport(_)), "got: {err}");
    }
}
