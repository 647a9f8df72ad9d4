//! # Validation Module
//!
//! Checks applied to records and queued writes at the store boundary.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: serde (remote JSON → typed payload)                          │
//! │  ├── Required fields present, right JSON types                         │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Non-empty ids and titles, length limits                           │
//! │  ├── Checksums are hex, URLs have a scheme                             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                                                       │
//! │  ├── CHECK constraints on status columns                               │
//! │  ├── UNIQUE pending idempotency key                                    │
//! │  └── Foreign keys with ON DELETE CASCADE                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::{AssetRecord, LessonRecord, OutboxWrite, UnitRecord};
use crate::{MAX_ID_LEN, MAX_TITLE_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a record identifier.
///
/// ## Example
/// ```rust
/// use scholar_core::validation::validate_id;
///
/// assert!(validate_id("unit_id", "u-42").is_ok());
/// assert!(validate_id("unit_id", "  ").is_err());
/// ```
pub fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    let id = id.trim();

    if id.is_empty() {
        return Err(ValidationError::required(field));
    }

    if id.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LEN,
        });
    }

    Ok(())
}

/// Validates a unit or lesson title.
pub fn validate_title(title: &str) -> ValidationResult<()> {
    let title = title.trim();

    if title.is_empty() {
        return Err(ValidationError::required("title"));
    }

    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ValidationError::TooLong {
            field: "title".to_string(),
            max: MAX_TITLE_LEN,
        });
    }

    Ok(())
}

/// Validates a unit before it is written.
pub fn validate_unit(unit: &UnitRecord) -> ValidationResult<()> {
    validate_id("unit.id", &unit.id)?;
    validate_title(&unit.payload.title)?;
    for lesson_id in &unit.payload.lesson_ids {
        validate_id("unit.lesson_ids", lesson_id)?;
    }
    Ok(())
}

/// Validates a lesson before it is written.
pub fn validate_lesson(lesson: &LessonRecord) -> ValidationResult<()> {
    validate_id("lesson.id", &lesson.id)?;
    validate_id("lesson.unit_id", &lesson.unit_id)?;
    validate_title(&lesson.payload.title)?;

    if lesson.payload.position < 0 {
        return Err(ValidationError::OutOfRange {
            field: "lesson.position".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

/// Validates an asset row before it is written.
pub fn validate_asset(asset: &AssetRecord) -> ValidationResult<()> {
    validate_id("asset.id", &asset.id)?;
    validate_id("asset.unit_id", &asset.unit_id)?;
    validate_id("asset.owner_id", &asset.owner_id)?;
    validate_remote_url(&asset.remote_url)?;

    if let Some(checksum) = &asset.checksum {
        validate_checksum(checksum)?;
    }

    if let Some(size) = asset.size {
        if size < 0 {
            return Err(ValidationError::OutOfRange {
                field: "asset.size".to_string(),
                min: 0,
                max: i64::MAX,
            });
        }
    }

    Ok(())
}

/// Validates a remote URL has an `http` or `https` scheme.
///
/// ## Example
/// ```rust
/// use scholar_core::validation::validate_remote_url;
///
/// assert!(validate_remote_url("https://cdn.example.com/a.png").is_ok());
/// assert!(validate_remote_url("cdn.example.com/a.png").is_err());
/// ```
pub fn validate_remote_url(url: &str) -> ValidationResult<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ValidationError::required("remote_url"));
    }

    let has_scheme = ["http://", "https://"]
        .iter()
        .any(|scheme| {
            url.len() > scheme.len()
                && url
                    .get(..scheme.len())
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        });

    if !has_scheme {
        return Err(ValidationError::invalid(
            "remote_url",
            "must start with http:// or https://",
        ));
    }

    Ok(())
}

/// Validates a SHA-256 checksum in hex.
pub fn validate_checksum(checksum: &str) -> ValidationResult<()> {
    if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::invalid(
            "checksum",
            "must be 64 hexadecimal characters (SHA-256)",
        ));
    }
    Ok(())
}

/// Validates a write before it enters the outbox.
pub fn validate_outbox_write(write: &OutboxWrite) -> ValidationResult<()> {
    validate_id("intent", &write.intent)?;
    validate_id("idempotency_key", &write.idempotency_key)?;
    if let Some(target) = &write.target {
        validate_id("target", target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetStatus, LessonPayload, UnitPayload};
    use serde_json::json;

    fn asset() -> AssetRecord {
        AssetRecord {
            id: "a1".into(),
            unit_id: "u1".into(),
            owner_id: "L1".into(),
            remote_url: "https://cdn.example.com/a1.mp3".into(),
            local_uri: None,
            status: AssetStatus::Missing,
            checksum: None,
            size: None,
        }
    }

    #[test]
    fn test_validate_title() {
        assert!(validate_title("Fractions").is_ok());
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"x".repeat(MAX_TITLE_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_unit_rejects_blank_lesson_ids() {
        let mut payload = UnitPayload::titled("Fractions");
        payload.lesson_ids = vec!["L1".into(), "".into()];
        let unit = UnitRecord::new("u1", payload, 3);
        assert!(validate_unit(&unit).is_err());
    }

    #[test]
    fn test_validate_lesson_position() {
        let lesson = LessonRecord {
            id: "L1".into(),
            unit_id: "u1".into(),
            payload: LessonPayload::titled("Intro", -1),
            synced_at: None,
        };
        assert!(matches!(
            validate_lesson(&lesson),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_asset() {
        assert!(validate_asset(&asset()).is_ok());

        let mut bad = asset();
        bad.remote_url = "ftp://cdn/a1".into();
        assert!(validate_asset(&bad).is_err());

        let mut bad = asset();
        bad.remote_url = "file:///sdcard/a1.png".into();
        assert!(validate_asset(&bad).is_err());

        let mut bad = asset();
        bad.checksum = Some("not-hex".into());
        assert!(validate_asset(&bad).is_err());

        let mut bad = asset();
        bad.size = Some(-5);
        assert!(validate_asset(&bad).is_err());
    }

    #[test]
    fn test_validate_checksum() {
        assert!(validate_checksum(&"a".repeat(64)).is_ok());
        assert!(validate_checksum(&"a".repeat(63)).is_err());
    }

    #[test]
    fn test_validate_outbox_write() {
        let write = OutboxWrite::new("progress", "p1", json!({"pct": 50}));
        assert!(validate_outbox_write(&write).is_ok());

        let write = OutboxWrite::new("progress", "", json!({}));
        assert_eq!(
            validate_outbox_write(&write),
            Err(ValidationError::required("idempotency_key"))
        );
    }
}
