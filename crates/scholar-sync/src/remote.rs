//! # Remote Sync Contract
//!
//! The two network collaborators of the cache, as traits, plus the HTTP
//! implementation used in the app.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync API Contract                                │
//! │                                                                         │
//! │  POST {base}/sync/push                                                 │
//! │    body:     { device_id, entries: [{idempotency_key, intent,          │
//! │                                      target, payload}] }               │
//! │    response: { results: [{idempotency_key, status, message?}] }        │
//! │              status = accepted | rejected | retry                      │
//! │                                                                         │
//! │  GET  {base}/sync/pull?cursor=..&mode=minimal&full=u1,u2&refresh=u2    │
//! │    response: { cursor, units: [...], lessons: [...],                   │
//! │                deleted_ids: [...] }                                    │
//! │                                                                         │
//! │  GET  {asset remote_url}                → raw bytes                    │
//! │                                                                         │
//! │  Status classes:                                                       │
//! │    2xx            ok                                                   │
//! │    408, 429, 5xx  transient (retry later)                              │
//! │    other 4xx      rejected                                             │
//! │    no response    offline / timeout                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use scholar_core::{CacheMode, OutboxEntry, PulledDelta};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult, RemoteError};

// =============================================================================
// Wire Types
// =============================================================================

/// One queued write as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEntry {
    pub idempotency_key: String,
    pub intent: String,
    pub target: String,
    pub payload: Value,
}

impl From<&OutboxEntry> for PushEntry {
    fn from(entry: &OutboxEntry) -> Self {
        PushEntry {
            idempotency_key: entry.idempotency_key.clone(),
            intent: entry.intent.clone(),
            target: entry.target.clone(),
            payload: entry.payload.clone(),
        }
    }
}

/// Server verdict on one pushed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    /// Stored (or already stored under this key).
    Accepted,
    /// Invalid; will never be accepted.
    Rejected,
    /// Try again later.
    Retry,
}

/// Per-entry push result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResult {
    pub idempotency_key: String,
    pub status: PushStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PushResult {
    pub fn accepted(key: impl Into<String>) -> Self {
        PushResult {
            idempotency_key: key.into(),
            status: PushStatus::Accepted,
            message: None,
        }
    }

    pub fn rejected(key: impl Into<String>, message: impl Into<String>) -> Self {
        PushResult {
            idempotency_key: key.into(),
            status: PushStatus::Rejected,
            message: Some(message.into()),
        }
    }

    pub fn retry(key: impl Into<String>, message: impl Into<String>) -> Self {
        PushResult {
            idempotency_key: key.into(),
            status: PushStatus::Retry,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct PushBody<'a> {
    device_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<&'a str>,
    entries: &'a [PushEntry],
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    results: Vec<PushResult>,
}

/// Parameters of a delta pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullRequest {
    /// Position to resume from; `None` pulls everything.
    pub cursor: Option<String>,
    /// Shape for units not listed in `full`.
    pub default_mode: CacheMode,
    /// Units the learner keeps in `full` mode.
    pub full: Vec<String>,
    /// Units to re-send in full even if unchanged since the cursor.
    pub refresh: Vec<String>,
}

impl PullRequest {
    /// Query-string pairs in wire order. Empty values are omitted.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);
        if let Some(cursor) = self.cursor.as_deref().filter(|c| !c.is_empty()) {
            pairs.push(("cursor", cursor.to_string()));
        }
        pairs.push(("mode", self.default_mode.as_str().to_string()));
        if !self.full.is_empty() {
            pairs.push(("full", self.full.join(",")));
        }
        if !self.refresh.is_empty() {
            pairs.push(("refresh", self.refresh.join(",")));
        }
        pairs
    }
}

// =============================================================================
// Traits
// =============================================================================

/// The sync API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Delivers a batch of writes; returns one result per entry.
    async fn push(&self, entries: &[PushEntry]) -> Result<Vec<PushResult>, RemoteError>;

    /// Fetches everything that changed since `request.cursor`.
    async fn pull(&self, request: &PullRequest) -> Result<PulledDelta, RemoteError>;
}

/// Downloads media bytes.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// `reqwest`-backed [`RemoteApi`] and [`AssetFetcher`].
///
/// Clone is cheap; the inner client shares one connection pool.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    token: Option<String>,
    device_id: String,
    device_name: Option<String>,
    download_timeout: Duration,
}

impl HttpRemote {
    /// Creates a client for the API at `base_url`.
    ///
    /// ## Arguments
    /// * `base_url` - API root, e.g. `https://api.scholar.example.com/v1`
    /// * `token` - Bearer token, if the learner is signed in
    /// * `device_id` - Sent with every push
    /// * `request_timeout` - Timeout for push/pull requests
    pub fn new(
        base_url: &str,
        token: Option<String>,
        device_id: impl Into<String>,
        request_timeout: Duration,
    ) -> CacheResult<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| CacheError::validation(format!("Invalid API URL: {}", e)))?;

        // `join` replaces the last segment unless the path ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CacheError::internal(format!("HTTP client: {}", e)))?;

        Ok(HttpRemote {
            client,
            base_url,
            token,
            device_id: device_id.into(),
            device_name: None,
            download_timeout: request_timeout,
        })
    }

    /// Builds the client from the `[remote]` and `[device]` config sections.
    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let mut remote = Self::new(
            &config.remote.base_url,
            config.remote.token.clone(),
            config.device_id(),
            config.request_timeout(),
        )?;
        remote.download_timeout = config.download_timeout();
        Ok(remote.with_device_name(config.device.name.clone()))
    }

    /// Name sent alongside the device id on every push.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.device_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    fn push_body<'a>(&'a self, entries: &'a [PushEntry]) -> PushBody<'a> {
        PushBody {
            device_id: &self.device_id,
            device_name: self.device_name.as_deref(),
            entries,
        }
    }

    /// Full URL of an API path such as `sync/pull`.
    pub fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::InvalidResponse(format!("Bad endpoint {}: {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET request for an asset. The bearer token goes only to the API's
    /// own origin; CDN and third-party hosts get an anonymous request.
    fn asset_request(&self, url: Url) -> reqwest::RequestBuilder {
        let same_origin = url.origin() == self.base_url.origin();
        let request = self.client.get(url).timeout(self.download_timeout);
        if same_origin {
            self.authorize(request)
        } else {
            request
        }
    }

    async fn check_response(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "Sync API returned an error status");
        Err(RemoteError::from_status(status.as_u16(), &body))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn push(&self, entries: &[PushEntry]) -> Result<Vec<PushResult>, RemoteError> {
        let url = self.endpoint("sync/push")?;
        debug!(count = entries.len(), "Pushing outbox entries");

        let body = self.push_body(entries);

        let response = self.authorize(self.client.post(url).json(&body)).send().await?;
        let response = Self::check_response(response).await?;
        let parsed: PushResponse = response.json().await?;

        Ok(parsed.results)
    }

    async fn pull(&self, request: &PullRequest) -> Result<PulledDelta, RemoteError> {
        let mut url = self.endpoint("sync/pull")?;
        url.query_pairs_mut().extend_pairs(request.query_pairs());
        debug!(%url, "Pulling remote changes");

        let response = self.authorize(self.client.get(url)).send().await?;
        let response = Self::check_response(response).await?;
        let delta: PulledDelta = response.json().await?;

        Ok(delta)
    }
}

#[async_trait]
impl AssetFetcher for HttpRemote {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let url = Url::parse(url).map_err(|e| RemoteError::Rejected {
            status: 0,
            message: format!("Invalid asset URL {}: {}", url, e),
        })?;

        let response = self.asset_request(url).send().await?;
        let response = Self::check_response(response).await?;
        let bytes = response.bytes().await?;

        Ok(bytes.to_vec())
    }
}
