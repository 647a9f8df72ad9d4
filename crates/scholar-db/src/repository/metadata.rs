//! # Cache Metadata Repository
//!
//! The singleton `cache_metadata` row: schema version, sync cursor and the
//! outcome of the last sync cycle.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use scholar_core::{CacheMetadata, MetadataUpdate, SyncOutcome};

use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct MetadataRow {
    schema_version: i64,
    last_sync_cursor: Option<String>,
    last_sync_status: Option<SyncOutcome>,
    last_sync_at: Option<DateTime<Utc>>,
    last_sync_error: Option<String>,
}

impl From<MetadataRow> for CacheMetadata {
    fn from(row: MetadataRow) -> Self {
        CacheMetadata {
            schema_version: row.schema_version,
            last_sync_cursor: row.last_sync_cursor,
            last_sync_status: row.last_sync_status,
            last_sync_at: row.last_sync_at,
            last_sync_error: row.last_sync_error,
        }
    }
}

pub(crate) async fn fetch_metadata(conn: &mut SqliteConnection) -> DbResult<Option<CacheMetadata>> {
    let row: Option<MetadataRow> = sqlx::query_as(
        r#"
        SELECT schema_version, last_sync_cursor, last_sync_status, last_sync_at, last_sync_error
        FROM cache_metadata WHERE id = 1
        "#,
    )
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(CacheMetadata::from))
}

/// Applies a partial update; untouched columns keep their value.
pub(crate) async fn write_metadata(conn: &mut SqliteConnection, update: &MetadataUpdate) -> DbResult<()> {
    if update.is_empty() {
        return Ok(());
    }

    let mut current = fetch_metadata(conn)
        .await?
        .ok_or_else(|| DbError::not_found("cache_metadata", "1"))?;

    if let Some(version) = update.schema_version {
        current.schema_version = version;
    }
    if let Some(cursor) = &update.last_sync_cursor {
        current.last_sync_cursor = cursor.clone();
    }
    if let Some(status) = update.last_sync_status {
        current.last_sync_status = Some(status);
    }
    if let Some(at) = update.last_sync_at {
        current.last_sync_at = Some(at);
    }
    if let Some(error) = &update.last_sync_error {
        current.last_sync_error = error.clone();
    }

    sqlx::query(
        r#"
        UPDATE cache_metadata SET
            schema_version = ?1,
            last_sync_cursor = ?2,
            last_sync_status = ?3,
            last_sync_at = ?4,
            last_sync_error = ?5
        WHERE id = 1
        "#,
    )
    .bind(current.schema_version)
    .bind(&current.last_sync_cursor)
    .bind(current.last_sync_status)
    .bind(current.last_sync_at)
    .bind(&current.last_sync_error)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Repository for the cache metadata row.
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    pool: SqlitePool,
}

impl MetadataRepository {
    /// Creates a new MetadataRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MetadataRepository { pool }
    }

    /// Reads the metadata row; `None` before [`crate::Database::initialize`].
    pub async fn get(&self) -> DbResult<Option<CacheMetadata>> {
        let mut conn = self.pool.acquire().await?;
        fetch_metadata(&mut conn).await
    }

    /// Stored sync cursor, if any.
    pub async fn cursor(&self) -> DbResult<Option<String>> {
        Ok(self.get().await?.and_then(|m| m.last_sync_cursor))
    }

    /// Applies a partial update.
    pub async fn update(&self, update: &MetadataUpdate) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_metadata(&mut conn, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_partial_updates() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        let repo = db.metadata();

        repo.update(&MetadataUpdate::default().cursor(Some("c1".into())))
            .await
            .unwrap();
        repo.update(
            &MetadataUpdate::default()
                .status(SyncOutcome::Failed, Utc::now())
                .error(Some("offline".into())),
        )
        .await
        .unwrap();

        let meta = repo.get().await.unwrap().unwrap();
        assert_eq!(meta.last_sync_cursor.as_deref(), Some("c1"));
        assert_eq!(meta.last_sync_status, Some(SyncOutcome::Failed));
        assert_eq!(meta.last_sync_error.as_deref(), Some("offline"));

        repo.update(&MetadataUpdate::default().error(None)).await.unwrap();
        let meta = repo.get().await.unwrap().unwrap();
        assert!(meta.last_sync_error.is_none());
        assert_eq!(repo.cursor().await.unwrap().as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_update_before_initialize_fails() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db
            .metadata()
            .update(&MetadataUpdate::default().cursor(None))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
