//! # Cache Configuration
//!
//! Configuration management for the learner cache.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SCHOLAR_API_URL=https://api.scholar.example.com                    │
//! │     SCHOLAR_DEVICE_ID=abc-123                                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/learner/cache.toml (Linux)                               │
//! │     ~/Library/Application Support/com.scholar.learner/cache.toml       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, app data dir for store and assets        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # cache.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Amira's tablet"
//!
//! [remote]
//! base_url = "https://api.scholar.example.com"
//! request_timeout_secs = 30
//!
//! [storage]
//! db_path = "/data/scholar/cache.db"
//! assets_dir = "/data/scholar/assets"
//!
//! [sync]
//! interval_secs = 900
//! backoff_base_secs = 2
//! backoff_cap_secs = 600
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ConfigError;

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name, sent with every push.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Learner Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

/// Where the sync API lives and how to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the sync API; `/sync/push` and `/sync/pull` hang off it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token for the learner session, if signed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Timeout for push/pull requests (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for a single media download (seconds).
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.scholar.example.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    120
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            base_url: default_base_url(),
            token: None,
            request_timeout_secs: default_request_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// On-device locations. Unset paths resolve under the app data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file for the local store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,

    /// Directory holding downloaded media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<PathBuf>,
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between background sync cycles (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// First outbox retry delay (seconds).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Longest outbox retry delay (seconds).
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Start a background sync on the first read of an empty store.
    #[serde(default = "default_true")]
    pub sync_on_first_access: bool,

    /// Download media of `full` units after each successful sync.
    #[serde(default = "default_true")]
    pub prefetch_after_sync: bool,
}

fn default_interval() -> u64 {
    900
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval_secs: default_interval(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            sync_on_first_access: true,
            prefetch_after_sync: true,
        }
    }
}

// =============================================================================
// Main Cache Configuration
// =============================================================================

/// Complete cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Sync API settings.
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Store and media locations.
    #[serde(default)]
    pub storage: StorageSettings,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,
}

impl CacheConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (cache.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading cache config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load cache config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> Result<(), ConfigError> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ConfigError::SaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;

        info!(?path, "Cache config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.id.trim().is_empty() {
            return Err(ConfigError::MissingDeviceId);
        }

        let url = url::Url::parse(&self.remote.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.remote.base_url
            )));
        }

        if self.remote.request_timeout_secs == 0 || self.remote.download_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "timeouts must be greater than 0".into(),
            ));
        }

        if self.sync.backoff_base_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "backoff_base_secs must be greater than 0".into(),
            ));
        }

        if self.sync.backoff_base_secs > self.sync.backoff_cap_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "backoff_base_secs ({}) exceeds backoff_cap_secs ({})",
                self.sync.backoff_base_secs, self.sync.backoff_cap_secs
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("SCHOLAR_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(url) = std::env::var("SCHOLAR_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.remote.base_url = url;
        }

        if let Ok(token) = std::env::var("SCHOLAR_API_TOKEN") {
            debug!("Overriding API token from environment");
            self.remote.token = Some(token);
        }

        if let Ok(path) = std::env::var("SCHOLAR_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.db_path = Some(PathBuf::from(path));
        }

        if let Ok(dir) = std::env::var("SCHOLAR_ASSETS_DIR") {
            debug!(dir = %dir, "Overriding assets directory from environment");
            self.storage.assets_dir = Some(PathBuf::from(dir));
        }

        if let Ok(interval) = std::env::var("SCHOLAR_SYNC_INTERVAL_SECS") {
            match interval.parse::<u64>() {
                Ok(secs) => self.sync.interval_secs = secs,
                Err(_) => warn!(value = %interval, "Ignoring invalid SCHOLAR_SYNC_INTERVAL_SECS"),
            }
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "scholar", "learner")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("cache.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Path of the SQLite store.
    pub fn database_path(&self) -> PathBuf {
        self.storage.db_path.clone().unwrap_or_else(|| {
            Self::project_dirs()
                .map(|dirs| dirs.data_dir().join("scholar-cache.db"))
                .unwrap_or_else(|| PathBuf::from("scholar-cache.db"))
        })
    }

    /// Directory for downloaded media.
    pub fn assets_dir(&self) -> PathBuf {
        self.storage.assets_dir.clone().unwrap_or_else(|| {
            Self::project_dirs()
                .map(|dirs| dirs.cache_dir().join("assets"))
                .unwrap_or_else(|| PathBuf::from("assets"))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.download_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.sync.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.sync.backoff_cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(!config.device.id.is_empty()); // Auto-generated
        assert_eq!(config.sync.backoff_base_secs, 2);
        assert_eq!(config.sync.backoff_cap_secs, 600);
        assert!(config.sync.sync_on_first_access);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CacheConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingDeviceId)));

        config.device.id = "tablet-1".to_string();
        config.remote.base_url = "ftp://api.scholar.example.com".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));

        config.remote.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));

        config.remote.base_url = "http://localhost:8080".to_string();
        assert!(config.validate().is_ok());

        config.remote.request_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        config.remote.request_timeout_secs = 30;
        config.sync.backoff_base_secs = 900;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(
            &path,
            r#"
            [device]
            id = "tablet-7"

            [sync]
            backoff_cap_secs = 60
            "#,
        )
        .unwrap();

        let config = CacheConfig::load(Some(path)).unwrap();
        assert_eq!(config.device_id(), "tablet-7");
        assert_eq!(config.backoff_cap(), Duration::from_secs(60));
        assert_eq!(config.sync.backoff_base_secs, 2);
        assert_eq!(config.remote.request_timeout_secs, 30);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.toml");

        let mut config = CacheConfig::default();
        config.storage.assets_dir = Some(dir.path().join("media"));
        config.save(Some(path.clone())).unwrap();

        let loaded = CacheConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.id, config.device.id);
        assert_eq!(loaded.assets_dir(), dir.path().join("media"));
    }

    #[test]
    fn test_toml_serialization() {
        let config = CacheConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[remote]"));
        assert!(toml_str.contains("[sync]"));
    }
}
