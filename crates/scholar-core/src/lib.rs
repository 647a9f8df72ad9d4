//! # scholar-core: Pure Model for the Learner Offline Cache
//!
//! This crate holds the records the mobile learner app mirrors on-device
//! (units, lessons, media assets, queued writes, cache metadata) and the pure
//! rules that govern them. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Scholar Cache Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Learner UI / learning-session module               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        scholar-sync: CacheService, SyncEngine, Outbox, Assets   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 scholar-db: SQLite local store                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ scholar-core (THIS CRATE) ★                     │   │
//! │  │   types • merge rules • validation • errors                     │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, payloads and status enums
//! - [`merge`] - How pulled remote metadata combines with local state
//! - [`validation`] - Checks applied at the store boundary
//! - [`error`] - Domain error types

pub mod error;
pub mod merge;
pub mod types;
pub mod validation;

pub use error::{CoreError, ValidationError};
pub use merge::{merge_remote_asset, AssetMerge, RemoteAssetMeta};
pub use types::*;

/// Version of the on-device table layout written by this build.
///
/// Bump this whenever stored rows would no longer decode. A store stamped
/// with an older version than [`MIN_SUPPORTED_SCHEMA_VERSION`] is purged and
/// re-seeded from an empty cursor.
pub const SCHEMA_VERSION: i64 = 3;

/// Oldest stored schema version this build can still read in place.
pub const MIN_SUPPORTED_SCHEMA_VERSION: i64 = 3;

/// Maximum length of unit and lesson titles.
pub const MAX_TITLE_LEN: usize = 300;

/// Maximum length of any record identifier.
pub const MAX_ID_LEN: usize = 128;
