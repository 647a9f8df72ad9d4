//! # Domain Types
//!
//! Records mirrored into the on-device cache.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Cache Records                                   │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   UnitRecord    │ 1 │  LessonRecord   │   │   AssetRecord   │       │
//! │  │  ─────────────  │──►│  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │ * │  id             │   │  id             │       │
//! │  │  payload        │   │  unit_id (FK)   │   │  unit_id (FK)   │       │
//! │  │  cache_mode     │   │  payload        │   │  owner_id       │       │
//! │  │  download_status│   └─────────────────┘   │  local_uri?     │       │
//! │  └─────────────────┘                         │  status         │       │
//! │                                              └─────────────────┘       │
//! │  ┌─────────────────┐   ┌─────────────────┐                             │
//! │  │  OutboxEntry    │   │ CacheMetadata   │                             │
//! │  │  idempotency_key│   │ schema_version  │                             │
//! │  │  intent/target  │   │ last_sync_cursor│                             │
//! │  │  attempt_count  │   │ last_sync_status│                             │
//! │  └─────────────────┘   └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Payloads are typed at the store boundary. Unknown fields sent by a newer
//! server are kept in `extra` and written back unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::merge::RemoteAssetMeta;

// =============================================================================
// Status Enums
// =============================================================================

/// Per-unit cache policy.
///
/// `Minimal` keeps text only; `Full` also prefetches every media asset the
/// unit and its lessons reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Minimal,
    Full,
}

/// Download progress of a unit's media as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    Idle,
    Downloading,
    Ready,
    Failed,
}

/// Local state of a single media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    #[default]
    Missing,
    Downloading,
    Cached,
    Failed,
}

/// Delivery state of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    #[default]
    Pending,
    InFlight,
    FailedPermanent,
}

/// Outcome of the most recent sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Partial,
    Failed,
}

macro_rules! impl_status_text {
    ($ty:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Returns the stored/wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(CoreError::UnknownStatus {
                        field: $field.to_string(),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

impl_status_text!(CacheMode, "cache_mode", {
    Minimal => "minimal",
    Full => "full",
});

impl_status_text!(DownloadStatus, "download_status", {
    Idle => "idle",
    Downloading => "downloading",
    Ready => "ready",
    Failed => "failed",
});

impl_status_text!(AssetStatus, "asset_status", {
    Missing => "missing",
    Downloading => "downloading",
    Cached => "cached",
    Failed => "failed",
});

impl_status_text!(OutboxStatus, "outbox_status", {
    Pending => "pending",
    InFlight => "in_flight",
    FailedPermanent => "failed_permanent",
});

impl_status_text!(SyncOutcome, "sync_status", {
    Success => "success",
    Partial => "partial",
    Failed => "failed",
});

// =============================================================================
// Payloads
// =============================================================================

/// Content of a unit as delivered by the server.
///
/// A `minimal` pull carries title/summary/lesson ids; a `full` pull adds
/// whatever the server puts in `extra` (objectives, media captions, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPayload {
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default)]
    pub lesson_ids: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UnitPayload {
    /// Creates a payload with just a title.
    pub fn titled(title: impl Into<String>) -> Self {
        UnitPayload {
            title: title.into(),
            summary: None,
            lesson_ids: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Content of a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPayload {
    pub title: String,

    /// Ordering within the unit.
    #[serde(default)]
    pub position: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LessonPayload {
    /// Creates a payload with a title and position.
    pub fn titled(title: impl Into<String>, position: i64) -> Self {
        LessonPayload {
            title: title.into(),
            position,
            body: None,
            extra: Map::new(),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A locally mirrored learning unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: String,
    pub title: String,
    pub payload: UnitPayload,
    /// Shape in which `payload` was pulled.
    pub payload_mode: CacheMode,
    pub schema_version: i64,
    /// Shape the learner asked for.
    pub cache_mode: CacheMode,
    pub download_status: DownloadStatus,
    pub synced_at: Option<DateTime<Utc>>,
}

impl UnitRecord {
    /// Builds a fresh record for a unit seen for the first time.
    pub fn new(id: impl Into<String>, payload: UnitPayload, schema_version: i64) -> Self {
        UnitRecord {
            id: id.into(),
            title: payload.title.clone(),
            payload,
            payload_mode: CacheMode::Minimal,
            schema_version,
            cache_mode: CacheMode::Minimal,
            download_status: DownloadStatus::Idle,
            synced_at: None,
        }
    }

    /// Applies a pulled payload while keeping the learner's local choices
    /// (`cache_mode`, `download_status`).
    pub fn with_remote_payload(
        mut self,
        payload: UnitPayload,
        shape: CacheMode,
        schema_version: i64,
        synced_at: DateTime<Utc>,
    ) -> Self {
        self.title = payload.title.clone();
        self.payload = payload;
        self.payload_mode = shape;
        self.schema_version = schema_version;
        self.synced_at = Some(synced_at);
        self
    }

    /// True when the learner wants full content but only minimal is stored.
    pub fn needs_full_refresh(&self) -> bool {
        self.cache_mode == CacheMode::Full && self.payload_mode == CacheMode::Minimal
    }
}

/// A lesson belonging to exactly one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonRecord {
    pub id: String,
    pub unit_id: String,
    pub payload: LessonPayload,
    pub synced_at: Option<DateTime<Utc>>,
}

/// A downloadable media file referenced by a unit or lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    /// Unit that owns this asset, directly or through one of its lessons.
    pub unit_id: String,
    /// Unit or lesson that references the asset.
    pub owner_id: String,
    pub remote_url: String,
    pub local_uri: Option<String>,
    pub status: AssetStatus,
    /// Lowercase hex SHA-256 of the file, when the server knows it.
    pub checksum: Option<String>,
    pub size: Option<i64>,
}

impl AssetRecord {
    /// True when the row claims a usable local file.
    pub fn is_cached(&self) -> bool {
        self.status == AssetStatus::Cached && self.local_uri.is_some()
    }
}

/// A queued local mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    /// Insertion order; drains run in ascending `seq`.
    pub seq: i64,
    pub idempotency_key: String,
    pub intent: String,
    /// Logical resource the write touches. Writes to one target are
    /// delivered strictly in order.
    pub target: String,
    pub payload: Value,
    pub attempt_count: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// True when a pending entry may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at <= now
    }
}

/// A write handed to the outbox by a domain module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxWrite {
    pub intent: String,
    #[serde(default)]
    pub target: Option<String>,
    pub idempotency_key: String,
    pub payload: Value,
}

impl OutboxWrite {
    /// Creates a write whose ordering scope is its intent.
    pub fn new(intent: impl Into<String>, idempotency_key: impl Into<String>, payload: Value) -> Self {
        OutboxWrite {
            intent: intent.into(),
            target: None,
            idempotency_key: idempotency_key.into(),
            payload,
        }
    }

    /// Narrows the ordering scope to one logical resource (e.g. `lesson:L1`).
    pub fn for_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Target used for ordering; falls back to the intent.
    pub fn target_key(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.intent)
    }
}

/// Process-wide cache state (singleton row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub schema_version: i64,
    pub last_sync_cursor: Option<String>,
    pub last_sync_status: Option<SyncOutcome>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
}

/// Partial update of [`CacheMetadata`]. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataUpdate {
    pub schema_version: Option<i64>,
    pub last_sync_cursor: Option<Option<String>>,
    pub last_sync_status: Option<SyncOutcome>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<Option<String>>,
}

impl MetadataUpdate {
    pub fn cursor(mut self, cursor: Option<String>) -> Self {
        self.last_sync_cursor = Some(cursor);
        self
    }

    pub fn status(mut self, status: SyncOutcome, at: DateTime<Utc>) -> Self {
        self.last_sync_status = Some(status);
        self.last_sync_at = Some(at);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.last_sync_error = Some(error);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == MetadataUpdate::default()
    }
}

/// Filter for listing units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub cache_mode: Option<CacheMode>,
    pub download_status: Option<DownloadStatus>,
}

impl UnitFilter {
    pub fn all() -> Self {
        UnitFilter::default()
    }

    pub fn mode(cache_mode: CacheMode) -> Self {
        UnitFilter {
            cache_mode: Some(cache_mode),
            ..Default::default()
        }
    }
}

// =============================================================================
// Pulled Delta
// =============================================================================

/// A unit as returned by a delta pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulledUnit {
    pub id: String,
    /// Shape the server actually sent.
    #[serde(default)]
    pub mode: CacheMode,
    pub payload: UnitPayload,
    #[serde(default)]
    pub assets: Vec<RemoteAssetMeta>,
}

/// A lesson as returned by a delta pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulledLesson {
    pub id: String,
    pub unit_id: String,
    pub payload: LessonPayload,
    #[serde(default)]
    pub assets: Vec<RemoteAssetMeta>,
}

/// Everything that changed remotely since a cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PulledDelta {
    /// Cursor to store once this delta is applied.
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub units: Vec<PulledUnit>,
    #[serde(default)]
    pub lessons: Vec<PulledLesson>,
    /// Ids of units, lessons or assets removed remotely.
    #[serde(default)]
    pub deleted_ids: Vec<String>,
}

impl PulledDelta {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.lessons.is_empty() && self.deleted_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!(OutboxStatus::FailedPermanent.as_str(), "failed_permanent");
        assert_eq!("in_flight".parse::<OutboxStatus>().unwrap(), OutboxStatus::InFlight);
        assert_eq!("FULL".parse::<CacheMode>().unwrap(), CacheMode::Full);
        assert!("half".parse::<CacheMode>().is_err());
    }

    #[test]
    fn test_unit_payload_keeps_unknown_fields() {
        let raw = json!({
            "title": "Fractions",
            "lesson_ids": ["L1"],
            "objectives": ["add", "subtract"]
        });
        let payload: UnitPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.title, "Fractions");
        assert!(payload.extra.contains_key("objectives"));

        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["objectives"], json!(["add", "subtract"]));
    }

    #[test]
    fn test_remote_payload_keeps_local_choices() {
        let mut unit = UnitRecord::new("u1", UnitPayload::titled("Old"), 3);
        unit.cache_mode = CacheMode::Full;
        unit.download_status = DownloadStatus::Ready;

        let updated =
            unit.with_remote_payload(UnitPayload::titled("New"), CacheMode::Full, 3, Utc::now());
        assert_eq!(updated.title, "New");
        assert_eq!(updated.cache_mode, CacheMode::Full);
        assert_eq!(updated.download_status, DownloadStatus::Ready);
        assert!(updated.synced_at.is_some());
    }

    #[test]
    fn test_needs_full_refresh() {
        let mut unit = UnitRecord::new("u1", UnitPayload::titled("T"), 3);
        assert!(!unit.needs_full_refresh());
        unit.cache_mode = CacheMode::Full;
        assert!(unit.needs_full_refresh());
        unit.payload_mode = CacheMode::Full;
        assert!(!unit.needs_full_refresh());
    }

    #[test]
    fn test_outbox_write_target_defaults_to_intent() {
        let write = OutboxWrite::new("progress", "p1", json!({"pct": 50}));
        assert_eq!(write.target_key(), "progress");
        let write = write.for_target("lesson:L1");
        assert_eq!(write.target_key(), "lesson:L1");
    }

    #[test]
    fn test_outbox_entry_due() {
        let now = Utc::now();
        let mut entry = OutboxEntry {
            id: "e1".into(),
            seq: 1,
            idempotency_key: "k".into(),
            intent: "progress".into(),
            target: "progress".into(),
            payload: json!({}),
            attempt_count: 0,
            next_attempt_at: now,
            status: OutboxStatus::Pending,
            last_error: None,
            created_at: now,
        };
        assert!(entry.is_due(now));
        entry.next_attempt_at = now + Duration::seconds(30);
        assert!(!entry.is_due(now));
        entry.next_attempt_at = now;
        entry.status = OutboxStatus::InFlight;
        assert!(!entry.is_due(now));
    }

    #[test]
    fn test_metadata_update_builder() {
        assert!(MetadataUpdate::default().is_empty());
        let update = MetadataUpdate::default().cursor(Some("c1".into()));
        assert!(!update.is_empty());
        assert_eq!(update.last_sync_cursor, Some(Some("c1".to_string())));
    }
}
