// Cloud HTTP surface: login, site listing, and roster document fetch. Out of
// scope for the mesh runtime itself; consumed only through `RosterFetcher`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::roster::RosterDocument;

const API_BASE: &str = "https://cloud.plejd.com";
const APP_ID: &str = "zHtVqXt8k4yFyk2QGmgp48D9xZr2G1kv";
/// Parse-platform error code the cloud uses for bad credentials, distinct
/// from any other connectivity failure.
const AUTH_FAILURE_CODE: u32 = 101;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("cloud request failed: {0}")]
    ConnectionFailed(String),

    #[error("unexpected cloud response: {0}")]
    InvalidResponse(String),
}

impl CloudError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SiteSummary {
    #[serde(rename = "siteId")]
    pub site_id: String,
    pub title: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionToken")]
    session_token: String,
}

#[derive(Deserialize)]
struct ParseErrorBody {
    code: u32,
    error: String,
}

#[derive(Deserialize)]
struct SiteListResponse {
    result: Vec<SiteSummary>,
}

#[derive(Deserialize)]
struct SiteByIdResponse {
    result: RosterDocument,
}

/// The cloud client surface the core depends on. Scanning the mesh and
/// managing the GATT connection never touch this; it is only consulted at
/// `Manager::init` to resolve the roster document and crypto key.
#[async_trait]
pub trait RosterFetcher: Send + Sync {
    async fn list_sites(&self, username: &str, password: &str) -> Result<Vec<SiteSummary>, CloudError>;
    async fn verify_credentials(&self, username: &str, password: &str) -> Result<(), CloudError>;
    async fn load_site(&self, username: &str, password: &str, site_id: &str) -> Result<RosterDocument, CloudError>;
    /// The unparsed JSON document, for callers that want to snapshot it for
    /// offline recovery without re-deriving it from the typed projection.
    async fn raw_site(&self, username: &str, password: &str, site_id: &str) -> Result<serde_json::Value, CloudError>;
}

pub struct HttpRosterFetcher {
    client: Client,
}

impl HttpRosterFetcher {
    pub fn new() -> Result<Self, CloudError> {
        let client = Client::builder()
            .user_agent("plejd-mesh")
            .build()
            .map_err(|e| CloudError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }

    async fn login(&self, username: &str, password: &str) -> Result<String, CloudError> {
        let response = self
            .client
            .post(format!("{API_BASE}/parse/login"))
            .header("X-Parse-Application-Id", APP_ID)
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| CloudError::ConnectionFailed(e.to_string()))?;

        let response = Self::check_parse_error(response).await?;
        response
            .json::<LoginResponse>()
            .await
            .map(|body| body.session_token)
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))
    }

    async fn call_function(
        &self,
        session_token: &str,
        function: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, CloudError> {
        let mut request = self
            .client
            .post(format!("{API_BASE}/parse/functions/{function}"))
            .header("X-Parse-Application-Id", APP_ID)
            .header("X-Parse-Session-Token", session_token);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CloudError::ConnectionFailed(e.to_string()))?;
        Self::check_parse_error(response).await
    }

    /// Distinguish an authentication failure (Parse error code 101) from any
    /// other connectivity failure. A non-2xx response is read once as a Parse
    /// error body; a successful response is passed through untouched so the
    /// caller can still consume its body.
    async fn check_parse_error(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        if response.status() == StatusCode::UNAUTHORIZED || !response.status().is_success() {
            let status = response.status();
            let body: Result<ParseErrorBody, _> = response.json().await;
            return Err(match body {
                Ok(parsed) => classify_parse_error(&parsed),
                Err(_) => CloudError::ConnectionFailed(format!("cloud returned {status}")),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RosterFetcher for HttpRosterFetcher {
    async fn list_sites(&self, username: &str, password: &str) -> Result<Vec<SiteSummary>, CloudError> {
        let session_token = self.login(username, password).await?;
        let response = self.call_function(&session_token, "getSiteList", &[]).await?;
        let body: SiteListResponse = response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
        Ok(body.result)
    }

    async fn verify_credentials(&self, username: &str, password: &str) -> Result<(), CloudError> {
        self.login(username, password).await.map(|_| ())
    }

    async fn load_site(&self, username: &str, password: &str, site_id: &str) -> Result<RosterDocument, CloudError> {
        let session_token = self.login(username, password).await?;
        let response = self
            .call_function(&session_token, "getSiteById", &[("siteId", site_id)])
            .await?;
        let body: SiteByIdResponse = response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
        Ok(body.result)
    }

    async fn raw_site(&self, username: &str, password: &str, site_id: &str) -> Result<serde_json::Value, CloudError> {
        let session_token = self.login(username, password).await?;
        let response = self
            .call_function(&session_token, "getSiteById", &[("siteId", site_id)])
            .await?;
        response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))
    }
}

/// Translate a Parse-style error body into the authentication-vs-connectivity
/// distinction the error table requires.
fn classify_parse_error(body: &ParseErrorBody) -> CloudError {
    if body.code == AUTH_FAILURE_CODE {
        CloudError::AuthenticationFailed
    } else {
        CloudError::InvalidResponse(format!("{} (code {})", body.error, body.code))
    }
}

// ============================================================================
// FAKE ROSTER FETCHER
// ============================================================================

/// A scripted `RosterFetcher` for tests: holds one roster document and serves
/// it back regardless of the site id asked for, or fails every call the same
/// way if configured to.
pub struct FakeRosterFetcher {
    inner: std::sync::Mutex<FakeRosterState>,
}

struct FakeRosterState {
    document: Option<RosterDocument>,
    raw: Option<serde_json::Value>,
    sites: Vec<SiteSummary>,
    fail_with: Option<CloudErrorKind>,
}

/// `CloudError` is not `Clone` (it wraps owned strings built per-call from
/// formatted messages), so the fake stores a description of the error to
/// produce rather than a boxed instance.
#[derive(Clone)]
enum CloudErrorKind {
    AuthenticationFailed,
    ConnectionFailed(String),
    InvalidResponse(String),
}

impl CloudErrorKind {
    fn into_error(self) -> CloudError {
        match self {
            Self::AuthenticationFailed => CloudError::AuthenticationFailed,
            Self::ConnectionFailed(msg) => CloudError::ConnectionFailed(msg),
            Self::InvalidResponse(msg) => CloudError::InvalidResponse(msg),
        }
    }
}

impl FakeRosterFetcher {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(FakeRosterState {
                document: None,
                raw: None,
                sites: Vec::new(),
                fail_with: None,
            }),
        }
    }

    /// Serve this roster document (and its raw JSON form) from `load_site`/`raw_site`.
    pub fn with_site(self, document: RosterDocument, raw: serde_json::Value) -> Self {
        let mut state = self.inner.lock().unwrap();
        state.document = Some(document);
        state.raw = Some(raw);
        drop(state);
        self
    }

    pub fn with_sites(self, sites: Vec<SiteSummary>) -> Self {
        self.inner.lock().unwrap().sites = sites;
        self
    }

    /// Make every call fail with `CloudError::AuthenticationFailed`.
    pub fn with_auth_failure(self) -> Self {
        self.inner.lock().unwrap().fail_with = Some(CloudErrorKind::AuthenticationFailed);
        self
    }

    /// Make every call fail with `CloudError::ConnectionFailed`.
    pub fn with_connection_failure(self, message: impl Into<String>) -> Self {
        self.inner.lock().unwrap().fail_with = Some(CloudErrorKind::ConnectionFailed(message.into()));
        self
    }

    pub fn with_invalid_response(self, message: impl Into<String>) -> Self {
        self.inner.lock().unwrap().fail_with = Some(CloudErrorKind::InvalidResponse(message.into()));
        self
    }
}

impl Default for FakeRosterFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RosterFetcher for FakeRosterFetcher {
    async fn list_sites(&self, _username: &str, _password: &str) -> Result<Vec<SiteSummary>, CloudError> {
        let state = self.inner.lock().unwrap();
        if let Some(kind) = &state.fail_with {
            return Err(kind.clone().into_error());
        }
        Ok(state.sites.clone())
    }

    async fn verify_credentials(&self, _username: &str, _password: &str) -> Result<(), CloudError> {
        let state = self.inner.lock().unwrap();
        if let Some(kind) = &state.fail_with {
            return Err(kind.clone().into_error());
        }
        Ok(())
    }

    async fn load_site(&self, _username: &str, _password: &str, _site_id: &str) -> Result<RosterDocument, CloudError> {
        let state = self.inner.lock().unwrap();
        if let Some(kind) = &state.fail_with {
            return Err(kind.clone().into_error());
        }
        state
            .document
            .clone()
            .ok_or_else(|| CloudError::InvalidResponse("no site configured on fake fetcher".into()))
    }

    async fn raw_site(&self, _username: &str, _password: &str, _site_id: &str) -> Result<serde_json::Value, CloudError> {
        let state = self.inner.lock().unwrap();
        if let Some(kind) = &state.fail_with {
            return Err(kind.clone().into_error());
        }
        state
            .raw
            .clone()
            .ok_or_else(|| CloudError::InvalidResponse("no site configured on fake fetcher".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_code_is_distinguished_from_other_errors() {
        let auth_err = ParseErrorBody {
            code: AUTH_FAILURE_CODE,
            error: "invalid login parameters".into(),
        };
        assert!(matches!(classify_parse_error(&auth_err), CloudError::AuthenticationFailed));

        let other_err = ParseErrorBody {
            code: 1,
            error: "internal server error".into(),
        };
        assert!(matches!(classify_parse_error(&other_err), CloudError::InvalidResponse(_)));
    }

    fn sample_document() -> RosterDocument {
        serde_json::from_value(serde_json::json!({
            "site": {"siteId": "site-1", "title": "Home"},
            "plejdMesh": {"cryptoKey": "00112233445566778899aabbccddeeff"},
            "rooms": [],
            "scenes": [],
            "devices": [],
            "plejdDevices": [],
            "inputSettings": [],
            "outputSettings": [],
            "motionSensors": [],
            "deviceAddress": {},
            "rxAddress": {},
            "sceneIndex": {}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn fake_fetcher_serves_the_configured_site() {
        let fetcher = FakeRosterFetcher::new().with_site(sample_document(), serde_json::json!({"ok": true}));
        let document = fetcher.load_site("u", "p", "site-1").await.unwrap();
        assert_eq!(document.site.site_id, "site-1");
    }

    #[tokio::test]
    async fn fake_fetcher_without_a_site_reports_invalid_response() {
        let fetcher = FakeRosterFetcher::new();
        let err = fetcher.load_site("u", "p", "site-1").await.unwrap_err();
        assert!(matches!(err, CloudError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn fake_fetcher_can_be_scripted_to_fail_authentication() {
        let fetcher = FakeRosterFetcher::new().with_auth_failure();
        let err = fetcher.verify_credentials("u", "p").await.unwrap_err();
        assert!(matches!(err, CloudError::AuthenticationFailed));
    }
}
