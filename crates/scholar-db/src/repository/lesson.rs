//! # Lesson Repository
//!
//! Database operations for lessons. Every lesson belongs to exactly one unit;
//! writing a lesson whose unit is not stored fails with a foreign key error.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use scholar_core::validation::validate_lesson;
use scholar_core::LessonRecord;

use super::{decode_json, encode_json};
use crate::error::{DbError, DbResult};

const TABLE: &str = "lessons";

#[derive(Debug, sqlx::FromRow)]
struct LessonRow {
    id: String,
    unit_id: String,
    payload: String,
    synced_at: Option<DateTime<Utc>>,
}

impl LessonRow {
    fn into_record(self) -> DbResult<LessonRecord> {
        let payload = decode_json(TABLE, &self.id, &self.payload)?;
        Ok(LessonRecord {
            id: self.id,
            unit_id: self.unit_id,
            payload,
            synced_at: self.synced_at,
        })
    }
}

pub(crate) async fn write_lesson(conn: &mut SqliteConnection, lesson: &LessonRecord) -> DbResult<()> {
    validate_lesson(lesson)?;
    let payload = encode_json(TABLE, &lesson.id, &lesson.payload)?;

    sqlx::query(
        r#"
        INSERT INTO lessons (id, unit_id, payload, synced_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            unit_id = excluded.unit_id,
            payload = excluded.payload,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(&lesson.id)
    .bind(&lesson.unit_id)
    .bind(payload)
    .bind(lesson.synced_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Deletes a lesson and the assets it owns.
///
/// ## Returns
/// `None` if no such lesson, otherwise the local files of removed assets.
pub(crate) async fn remove_lesson(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Vec<String>>> {
    let files: Vec<String> = sqlx::query_scalar(
        "SELECT local_uri FROM assets WHERE owner_id = ?1 AND local_uri IS NOT NULL",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM assets WHERE owner_id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let deleted = sqlx::query("DELETE FROM lessons WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    Ok((deleted > 0).then_some(files))
}

/// Repository for lesson database operations.
#[derive(Debug, Clone)]
pub struct LessonRepository {
    pool: SqlitePool,
}

impl LessonRepository {
    /// Creates a new LessonRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LessonRepository { pool }
    }

    /// Inserts or replaces a lesson.
    pub async fn upsert(&self, lesson: &LessonRecord) -> DbResult<()> {
        debug!(lesson_id = %lesson.id, unit_id = %lesson.unit_id, "Upserting lesson");
        let mut conn = self.pool.acquire().await?;
        write_lesson(&mut conn, lesson).await
    }

    /// Gets a lesson by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<LessonRecord>> {
        let row: Option<LessonRow> =
            sqlx::query_as("SELECT id, unit_id, payload, synced_at FROM lessons WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(LessonRow::into_record).transpose()
    }

    /// Lists the lessons of a unit in `position` order.
    pub async fn list_for_unit(&self, unit_id: &str) -> DbResult<Vec<LessonRecord>> {
        let rows: Vec<LessonRow> = sqlx::query_as(
            "SELECT id, unit_id, payload, synced_at FROM lessons WHERE unit_id = ?1 ORDER BY id",
        )
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;

        let mut lessons = rows
            .into_iter()
            .map(LessonRow::into_record)
            .collect::<DbResult<Vec<_>>>()?;

        // Position lives inside the JSON payload.
        lessons.sort_by(|a, b| {
            a.payload
                .position
                .cmp(&b.payload.position)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(lessons)
    }

    /// Deletes a lesson and its assets.
    ///
    /// ## Returns
    /// Local files of the removed assets.
    pub async fn delete(&self, id: &str) -> DbResult<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let files = remove_lesson(&mut tx, id)
            .await?
            .ok_or_else(|| DbError::not_found("Lesson", id))?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use scholar_core::{LessonPayload, UnitPayload, UnitRecord};

    async fn db_with_unit() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        db.units()
            .upsert(&UnitRecord::new("u1", UnitPayload::titled("Fractions"), 3))
            .await
            .unwrap();
        db
    }

    fn lesson(id: &str, unit_id: &str, position: i64) -> LessonRecord {
        LessonRecord {
            id: id.into(),
            unit_id: unit_id.into(),
            payload: LessonPayload::titled(format!("Lesson {id}"), position),
            synced_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_list_for_unit_orders_by_position() {
        let db = db_with_unit().await;
        db.lessons().upsert(&lesson("La", "u1", 2)).await.unwrap();
        db.lessons().upsert(&lesson("Lb", "u1", 0)).await.unwrap();
        db.lessons().upsert(&lesson("Lc", "u1", 1)).await.unwrap();

        let ids: Vec<_> = db
            .lessons()
            .list_for_unit("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec!["Lb", "Lc", "La"]);
    }

    #[tokio::test]
    async fn test_lesson_requires_stored_unit() {
        let db = db_with_unit().await;
        let err = db.lessons().upsert(&lesson("L1", "ghost", 0)).await.unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
    }

    #[tokio::test]
    async fn test_delete_lesson() {
        let db = db_with_unit().await;
        db.lessons().upsert(&lesson("L1", "u1", 0)).await.unwrap();
        assert!(db.lessons().delete("L1").await.unwrap().is_empty());
        assert!(db.lessons().get("L1").await.unwrap().is_none());
        assert!(db.lessons().delete("L1").await.is_err());
    }
}
