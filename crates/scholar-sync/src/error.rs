//! # Cache Error Types
//!
//! Error types for the sync layer and the cache facade.
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Cache Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  ConfigError    │  │  RemoteError    │  │  CacheError (public)    │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Offline        │  │  kind: storage          │ │
//! │  │  MissingDeviceId│  │  Timeout        │  │        network          │ │
//! │  │  InvalidUrl     │  │  Server (5xx)   │  │        schema           │ │
//! │  │  LoadFailed     │  │  Rejected (4xx) │  │        asset            │ │
//! │  │  SaveFailed     │  │  InvalidResponse│  │        validation       │ │
//! │  └─────────────────┘  └─────────────────┘  │        internal         │ │
//! │                                            │  message: String        │ │
//! │                                            └─────────────────────────┘ │
//! │                                                                         │
//! │  DbError ──┐                                                           │
//! │  RemoteError ──► CacheError { kind } ──► UI                            │
//! │  io::Error ──┘                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use thiserror::Error;

use scholar_db::DbError;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// Cache Error
// =============================================================================

/// Coarse error category shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheErrorKind {
    /// Disk I/O failure or corrupt row. The operation can be retried.
    Storage,
    /// Offline, timeout or server error.
    Network,
    /// The stored layout was unusable and content was reset.
    Schema,
    /// A media download or verification failed.
    Asset,
    /// Bad input, unknown id, or a write the server rejected.
    Validation,
    /// A bug or a background task that died.
    Internal,
}

impl CacheErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheErrorKind::Storage => "storage",
            CacheErrorKind::Network => "network",
            CacheErrorKind::Schema => "schema",
            CacheErrorKind::Asset => "asset",
            CacheErrorKind::Validation => "validation",
            CacheErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for CacheErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error type the cache facade returns.
///
/// `Clone` so one failed in-flight sync or download can be handed to every
/// caller that attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} error: {message}")]
pub struct CacheError {
    pub kind: CacheErrorKind,
    pub message: String,
}

impl CacheError {
    pub fn new(kind: CacheErrorKind, message: impl Into<String>) -> Self {
        CacheError {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(CacheErrorKind::Storage, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(CacheErrorKind::Network, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(CacheErrorKind::Schema, message)
    }

    pub fn asset(message: impl Into<String>) -> Self {
        Self::new(CacheErrorKind::Asset, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(CacheErrorKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CacheErrorKind::Internal, message)
    }

    /// True if trying the same call again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, CacheErrorKind::Storage | CacheErrorKind::Network)
    }
}

// =============================================================================
// Remote Error
// =============================================================================

/// Failures talking to the sync API or the asset CDN.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    // =========================================================================
    // Connectivity
    // =========================================================================
    /// No route to the server (offline, DNS, refused connection).
    #[error("Server unreachable: {0}")]
    Offline(String),

    /// The request did not finish in time.
    #[error("Request timed out")]
    Timeout,

    // =========================================================================
    // HTTP Status
    // =========================================================================
    /// 408, 429 or 5xx: the server may accept the same request later.
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 400, 409, 413 or 422: the request body itself is wrong.
    #[error("Request rejected with {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Any other 4xx (expired session, forbidden, wrong route). The
    /// request may be fine; this device cannot use the API right now.
    #[error("Request refused with {status}: {message}")]
    Refused { status: u16, message: String },

    // =========================================================================
    // Protocol
    // =========================================================================
    /// 2xx with a body that does not match the contract.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length of a response body kept in an error message.
const MAX_ERROR_BODY_LENGTH: usize = 300;

impl RemoteError {
    /// Classifies a non-2xx HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate(body);
        match status {
            408 | 429 | 500..=599 => RemoteError::Server { status, message },
            400 | 409 | 413 | 422 => RemoteError::Rejected { status, message },
            _ => RemoteError::Refused { status, message },
        }
    }

    /// True if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }

    /// True if the device could not reach the server at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Offline(_) | RemoteError::Timeout)
    }

    /// True if the server answered but will not serve this session.
    pub fn is_refused(&self) -> bool {
        matches!(self, RemoteError::Refused { .. })
    }
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_BODY_LENGTH {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes)", &trimmed[..end], trimmed.len())
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::from_status(status.as_u16(), &err.to_string())
        } else {
            RemoteError::Offline(err.to_string())
        }
    }
}

// =============================================================================
// Config Error
// =============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Invalid API base URL.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    /// Failed to read or parse the config file.
    #[error("Failed to load config: {0}")]
    LoadFailed(String),

    /// Failed to write the config file.
    #[error("Failed to save config: {0}")]
    SaveFailed(String),
}

impl From<url::ParseError> for ConfigError {
    fn from(err: url::ParseError) -> Self {
        ConfigError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::LoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::LoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::SaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for CacheError {
    fn from(err: DbError) -> Self {
        match &err {
            DbError::Validation(_) | DbError::NotFound { .. } => {
                CacheError::validation(err.to_string())
            }
            DbError::MigrationFailed(_) => CacheError::schema(err.to_string()),
            _ => CacheError::storage(err.to_string()),
        }
    }
}

impl From<RemoteError> for CacheError {
    fn from(err: RemoteError) -> Self {
        match &err {
            RemoteError::Rejected { .. } => CacheError::validation(err.to_string()),
            _ => CacheError::network(err.to_string()),
        }
    }
}

impl From<ConfigError> for CacheError {
    fn from(err: ConfigError) -> Self {
        CacheError::validation(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::internal(format!("Background task failed: {}", err))
    }
}
