//! # Repository Module
//!
//! Database repository implementations for the learner cache.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  CacheService / SyncEngine                                             │
//! │       │                                                                 │
//! │       │  db.units().list(UnitFilter::all())                            │
//! │       ▼                                                                 │
//! │  UnitRepository (pool-backed, one statement per call)                  │
//! │       │                                                                 │
//! │       │  calls the same row helpers as ...                             │
//! │       ▼                                                                 │
//! │  delta::apply_delta (one transaction, many statements)                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Row helpers take `&mut SqliteConnection`, so a pooled connection     │
//! │  and an open transaction go through identical SQL.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`unit::UnitRepository`] - Units, cache mode, download status
//! - [`lesson::LessonRepository`] - Lessons within a unit
//! - [`asset::AssetRepository`] - Media asset rows and download state
//! - [`outbox::OutboxRepository`] - Queued learner writes
//! - [`metadata::MetadataRepository`] - Schema version and sync cursor
//! - [`delta`] - Atomic application of a pulled delta

pub mod asset;
pub mod delta;
pub mod lesson;
pub mod metadata;
pub mod outbox;
pub mod unit;

use crate::error::DbError;

/// Decodes a JSON payload column.
pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    table: &str,
    id: &str,
    raw: &str,
) -> Result<T, DbError> {
    serde_json::from_str(raw).map_err(|e| DbError::corrupt(table, id, e))
}

/// Encodes a value for a JSON payload column.
pub(crate) fn encode_json<T: serde::Serialize>(table: &str, id: &str, value: &T) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|e| DbError::corrupt(table, id, e))
}
