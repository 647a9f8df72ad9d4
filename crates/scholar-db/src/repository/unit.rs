//! # Unit Repository
//!
//! Database operations for learning units.
//!
//! ## Key Operations
//! - Upsert/get/list with an optional cache-mode or download-status filter
//! - Per-unit cache policy (`cache_mode`) and media progress (`download_status`)
//! - Cascading delete that reports the local files left behind
//!
//! ## Cascade
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DELETE FROM units WHERE id = 'u1'                                     │
//! │       │                                                                 │
//! │       ├── lessons.unit_id = 'u1'  → deleted (ON DELETE CASCADE)        │
//! │       └── assets.unit_id  = 'u1'  → deleted (ON DELETE CASCADE)        │
//! │                                                                         │
//! │  Files on disk are NOT touched here: their local_uris are returned     │
//! │  and the asset resolver removes them after the commit.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use scholar_core::validation::validate_unit;
use scholar_core::{CacheMode, DownloadStatus, UnitFilter, UnitRecord};

use super::{decode_json, encode_json};
use crate::error::{DbError, DbResult};

const TABLE: &str = "units";

#[derive(Debug, sqlx::FromRow)]
struct UnitRow {
    id: String,
    title: String,
    payload: String,
    payload_mode: CacheMode,
    schema_version: i64,
    cache_mode: CacheMode,
    download_status: DownloadStatus,
    synced_at: Option<DateTime<Utc>>,
}

impl UnitRow {
    fn into_record(self) -> DbResult<UnitRecord> {
        let payload = decode_json(TABLE, &self.id, &self.payload)?;
        Ok(UnitRecord {
            id: self.id,
            title: self.title,
            payload,
            payload_mode: self.payload_mode,
            schema_version: self.schema_version,
            cache_mode: self.cache_mode,
            download_status: self.download_status,
            synced_at: self.synced_at,
        })
    }
}

const SELECT_UNIT: &str = r#"
    SELECT id, title, payload, payload_mode, schema_version,
           cache_mode, download_status, synced_at
    FROM units
"#;

// =============================================================================
// Row helpers (pool connection or transaction)
// =============================================================================

pub(crate) async fn fetch_unit(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<UnitRecord>> {
    let row: Option<UnitRow> = sqlx::query_as(&format!("{SELECT_UNIT} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(UnitRow::into_record).transpose()
}

pub(crate) async fn write_unit(conn: &mut SqliteConnection, unit: &UnitRecord) -> DbResult<()> {
    validate_unit(unit)?;
    let payload = encode_json(TABLE, &unit.id, &unit.payload)?;

    sqlx::query(
        r#"
        INSERT INTO units (
            id, title, payload, payload_mode, schema_version,
            cache_mode, download_status, synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            payload = excluded.payload,
            payload_mode = excluded.payload_mode,
            schema_version = excluded.schema_version,
            cache_mode = excluded.cache_mode,
            download_status = excluded.download_status,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(&unit.id)
    .bind(&unit.title)
    .bind(payload)
    .bind(unit.payload_mode)
    .bind(unit.schema_version)
    .bind(unit.cache_mode)
    .bind(unit.download_status)
    .bind(unit.synced_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Deletes a unit and (by cascade) its lessons and assets.
///
/// ## Returns
/// `None` if no such unit, otherwise the local files of the removed assets.
pub(crate) async fn remove_unit(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Vec<String>>> {
    let files: Vec<String> = sqlx::query_scalar(
        "SELECT local_uri FROM assets WHERE unit_id = ?1 AND local_uri IS NOT NULL",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    // Children first, then the unit.
    sqlx::query("DELETE FROM assets WHERE unit_id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM lessons WHERE unit_id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let deleted = sqlx::query("DELETE FROM units WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    Ok((deleted > 0).then_some(files))
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for unit database operations.
///
/// ## Usage
/// ```rust,ignore
/// let repo = db.units();
///
/// let full = repo.list(UnitFilter::mode(CacheMode::Full)).await?;
/// repo.set_download_status("u1", DownloadStatus::Ready).await?;
/// ```
#[derive(Debug, Clone)]
pub struct UnitRepository {
    pool: SqlitePool,
}

impl UnitRepository {
    /// Creates a new UnitRepository.
    pub fn new(pool: SqlitePool) -> Self {
        UnitRepository { pool }
    }

    /// Inserts or replaces a unit.
    pub async fn upsert(&self, unit: &UnitRecord) -> DbResult<()> {
        debug!(unit_id = %unit.id, "Upserting unit");
        let mut conn = self.pool.acquire().await?;
        write_unit(&mut conn, unit).await
    }

    /// Gets a unit by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<UnitRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_unit(&mut conn, id).await
    }

    /// Lists units ordered by title.
    ///
    /// ## Arguments
    /// * `filter` - Optional cache mode / download status restriction
    pub async fn list(&self, filter: UnitFilter) -> DbResult<Vec<UnitRecord>> {
        let rows: Vec<UnitRow> = sqlx::query_as(&format!(
            "{SELECT_UNIT}
             WHERE (?1 IS NULL OR cache_mode = ?1)
               AND (?2 IS NULL OR download_status = ?2)
             ORDER BY title COLLATE NOCASE, id"
        ))
        .bind(filter.cache_mode)
        .bind(filter.download_status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UnitRow::into_record).collect()
    }

    /// Counts stored units.
    pub async fn count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM units")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Sets the learner's cache policy for a unit.
    ///
    /// ## Errors
    /// `NotFound` if the unit is not stored locally.
    pub async fn set_cache_mode(&self, id: &str, mode: CacheMode) -> DbResult<()> {
        let result = sqlx::query("UPDATE units SET cache_mode = ?2 WHERE id = ?1")
            .bind(id)
            .bind(mode)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Unit", id));
        }

        debug!(unit_id = %id, mode = %mode, "Cache mode updated");
        Ok(())
    }

    /// Records media download progress for a unit.
    pub async fn set_download_status(&self, id: &str, status: DownloadStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE units SET download_status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Unit", id));
        }

        Ok(())
    }

    /// Deletes a unit with its lessons and assets.
    ///
    /// ## Returns
    /// Local files of the removed assets; the caller deletes them.
    ///
    /// ## Errors
    /// `NotFound` if the unit is not stored locally.
    pub async fn delete(&self, id: &str) -> DbResult<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let files = remove_unit(&mut tx, id)
            .await?
            .ok_or_else(|| DbError::not_found("Unit", id))?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(unit_id = %id, files = files.len(), "Unit deleted");
        Ok(files)
    }

    /// Total bytes of stored unit and lesson payloads.
    pub async fn payload_bytes(&self) -> DbResult<i64> {
        let bytes: i64 = sqlx::query_scalar(
            r#"
            SELECT
                (SELECT COALESCE(SUM(LENGTH(CAST(payload AS BLOB))), 0) FROM units) +
                (SELECT COALESCE(SUM(LENGTH(CAST(payload AS BLOB))), 0) FROM lessons)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(bytes)
    }
}
