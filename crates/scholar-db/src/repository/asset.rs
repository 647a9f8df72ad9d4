//! # Asset Repository
//!
//! Database operations for media asset rows.
//!
//! ## Asset Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   pulled metadata ──► missing ──mark_downloading──► downloading         │
//! │                          ▲                              │               │
//! │                          │                   ┌──────────┴──────────┐    │
//! │      url/checksum changed│                   ▼                     ▼    │
//! │      file vanished       │                cached                failed  │
//! │      unit downgraded ────┴──────────────────┘                     │     │
//! │                                                                    │     │
//! │                      resolve() retries once ◄──────────────────────┘     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use scholar_core::validation::validate_asset;
use scholar_core::{merge_remote_asset, AssetMerge, AssetRecord, AssetStatus, RemoteAssetMeta};

use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct AssetRow {
    id: String,
    unit_id: String,
    owner_id: String,
    remote_url: String,
    local_uri: Option<String>,
    status: AssetStatus,
    checksum: Option<String>,
    size: Option<i64>,
}

impl From<AssetRow> for AssetRecord {
    fn from(row: AssetRow) -> Self {
        AssetRecord {
            id: row.id,
            unit_id: row.unit_id,
            owner_id: row.owner_id,
            remote_url: row.remote_url,
            local_uri: row.local_uri,
            status: row.status,
            checksum: row.checksum,
            size: row.size,
        }
    }
}

const SELECT_ASSET: &str = r#"
    SELECT id, unit_id, owner_id, remote_url, local_uri, status, checksum, size
    FROM assets
"#;

// =============================================================================
// Row helpers (pool connection or transaction)
// =============================================================================

pub(crate) async fn fetch_asset(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<AssetRecord>> {
    let row: Option<AssetRow> = sqlx::query_as(&format!("{SELECT_ASSET} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(AssetRecord::from))
}

pub(crate) async fn write_asset(conn: &mut SqliteConnection, asset: &AssetRecord) -> DbResult<()> {
    validate_asset(asset)?;

    sqlx::query(
        r#"
        INSERT INTO assets (id, unit_id, owner_id, remote_url, local_uri, status, checksum, size)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            unit_id = excluded.unit_id,
            owner_id = excluded.owner_id,
            remote_url = excluded.remote_url,
            local_uri = excluded.local_uri,
            status = excluded.status,
            checksum = excluded.checksum,
            size = excluded.size
        "#,
    )
    .bind(&asset.id)
    .bind(&asset.unit_id)
    .bind(&asset.owner_id)
    .bind(&asset.remote_url)
    .bind(&asset.local_uri)
    .bind(asset.status)
    .bind(&asset.checksum)
    .bind(asset.size)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Merges pulled metadata into the stored row and writes the result.
pub(crate) async fn merge_remote(
    conn: &mut SqliteConnection,
    unit_id: &str,
    owner_id: &str,
    incoming: &RemoteAssetMeta,
) -> DbResult<AssetMerge> {
    let existing = fetch_asset(conn, &incoming.id).await?;
    let merge = merge_remote_asset(existing.as_ref(), incoming, unit_id, owner_id);
    write_asset(conn, &merge.record).await?;
    Ok(merge)
}

/// Deletes one asset row.
///
/// ## Returns
/// `None` if no such asset, otherwise its local file (if any).
pub(crate) async fn remove_asset(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Vec<String>>> {
    let Some(existing) = fetch_asset(conn, id).await? else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM assets WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(Some(existing.local_uri.into_iter().collect()))
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for asset database operations.
#[derive(Debug, Clone)]
pub struct AssetRepository {
    pool: SqlitePool,
}

impl AssetRepository {
    /// Creates a new AssetRepository.
    pub fn new(pool: SqlitePool) -> Self {
        AssetRepository { pool }
    }

    /// Inserts or replaces an asset row as-is.
    pub async fn upsert(&self, asset: &AssetRecord) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_asset(&mut conn, asset).await
    }

    /// Applies pulled metadata with the merge rule (keeps a valid local file).
    pub async fn upsert_remote(
        &self,
        unit_id: &str,
        owner_id: &str,
        incoming: &RemoteAssetMeta,
    ) -> DbResult<AssetMerge> {
        let mut conn = self.pool.acquire().await?;
        merge_remote(&mut conn, unit_id, owner_id, incoming).await
    }

    /// Gets an asset by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<AssetRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_asset(&mut conn, id).await
    }

    /// Lists every asset owned by a unit or one of its lessons.
    pub async fn list_for_unit(&self, unit_id: &str) -> DbResult<Vec<AssetRecord>> {
        let rows: Vec<AssetRow> =
            sqlx::query_as(&format!("{SELECT_ASSET} WHERE unit_id = ?1 ORDER BY owner_id, id"))
                .bind(unit_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(AssetRecord::from).collect())
    }

    /// Flags a download as started.
    pub async fn mark_downloading(&self, id: &str) -> DbResult<()> {
        self.set_status(id, AssetStatus::Downloading).await
    }

    /// Flags a download as failed and clears the local file reference.
    pub async fn mark_failed(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE assets SET status = ?2, local_uri = NULL WHERE id = ?1")
            .bind(id)
            .bind(AssetStatus::Failed)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Asset", id));
        }
        Ok(())
    }

    /// Flags an asset as needing a download (file gone or evicted).
    pub async fn mark_missing(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE assets SET status = ?2, local_uri = NULL WHERE id = ?1")
            .bind(id)
            .bind(AssetStatus::Missing)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Asset", id));
        }
        Ok(())
    }

    /// Records a verified local file.
    ///
    /// The update only lands if the row still points at `remote_url`; a sync
    /// that replaced the asset mid-download wins.
    ///
    /// ## Returns
    /// `true` if the row was updated.
    pub async fn mark_cached(
        &self,
        id: &str,
        remote_url: &str,
        local_uri: &str,
        size: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE assets SET status = ?4, local_uri = ?3, size = ?5
            WHERE id = ?1 AND remote_url = ?2
            "#,
        )
        .bind(id)
        .bind(remote_url)
        .bind(local_uri)
        .bind(AssetStatus::Cached)
        .bind(size)
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        debug!(asset_id = %id, updated, "Asset marked cached");
        Ok(updated)
    }

    /// Resets every asset of a unit to `missing`.
    ///
    /// ## Returns
    /// The local files that were referenced; the caller deletes them.
    pub async fn reset_unit(&self, unit_id: &str) -> DbResult<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let files: Vec<String> = sqlx::query_scalar(
            "SELECT local_uri FROM assets WHERE unit_id = ?1 AND local_uri IS NOT NULL",
        )
        .bind(unit_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("UPDATE assets SET status = ?2, local_uri = NULL WHERE unit_id = ?1")
            .bind(unit_id)
            .bind(AssetStatus::Missing)
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(files)
    }

    /// Rows left `downloading` by a previous process go back to `missing`.
    pub async fn reset_interrupted_downloads(&self) -> DbResult<u64> {
        let result = sqlx::query("UPDATE assets SET status = ?1, local_uri = NULL WHERE status = ?2")
            .bind(AssetStatus::Missing)
            .bind(AssetStatus::Downloading)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes one asset row, returning its local file if it had one.
    pub async fn delete(&self, id: &str) -> DbResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        let files = remove_asset(&mut conn, id)
            .await?
            .ok_or_else(|| DbError::not_found("Asset", id))?;
        Ok(files.into_iter().next())
    }

    /// Every local file a row currently points at.
    pub async fn local_files(&self) -> DbResult<Vec<String>> {
        let files = sqlx::query_scalar("SELECT local_uri FROM assets WHERE local_uri IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        Ok(files)
    }

    /// Number of cached files.
    pub async fn count_cached(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM assets WHERE status = ?1")
            .bind(AssetStatus::Cached)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn set_status(&self, id: &str, status: AssetStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE assets SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Asset", id));
        }
        Ok(())
    }
}
