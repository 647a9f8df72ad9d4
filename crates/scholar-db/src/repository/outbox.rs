//! # Outbox Repository
//!
//! Durable queue of learner writes awaiting delivery.
//!
//! ## Entry States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Entry Lifecycle                               │
//! │                                                                         │
//! │  enqueue(write)                                                        │
//! │       │   same idempotency_key already pending? → replace it           │
//! │       │   (keeps the id, moves to the tail of the queue)               │
//! │       ▼                                                                 │
//! │  ┌──────────┐  mark_in_flight   ┌───────────┐  complete               │
//! │  │ pending  │ ────────────────► │ in_flight │ ─────────► (deleted)     │
//! │  └──────────┘                   └───────────┘                          │
//! │       ▲                           │       │                            │
//! │       │   defer (attempts += 1)   │       │ mark_failed_permanent      │
//! │       └───────────────────────────┘       ▼                            │
//! │       ▲                           ┌──────────────────┐                 │
//! │       │   retry_failed            │ failed_permanent │ ──abandon──► ✗  │
//! │       └───────────────────────────└──────────────────┘                 │
//! │                                                                         │
//! │  Crash while in_flight → recover_in_flight() at startup → pending      │
//! │  Delivery is at-least-once; the server dedupes on idempotency_key.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use scholar_core::validation::validate_outbox_write;
use scholar_core::{OutboxEntry, OutboxStatus, OutboxWrite};

use super::{decode_json, encode_json};
use crate::error::{DbError, DbResult};

const TABLE: &str = "outbox";

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    seq: i64,
    id: String,
    idempotency_key: String,
    intent: String,
    target: String,
    payload: String,
    attempt_count: i64,
    next_attempt_at: DateTime<Utc>,
    status: OutboxStatus,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl OutboxRow {
    fn into_entry(self) -> DbResult<OutboxEntry> {
        let payload: Value = decode_json(TABLE, &self.id, &self.payload)?;
        Ok(OutboxEntry {
            id: self.id,
            seq: self.seq,
            idempotency_key: self.idempotency_key,
            intent: self.intent,
            target: self.target,
            payload,
            attempt_count: self.attempt_count,
            next_attempt_at: self.next_attempt_at,
            status: self.status,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

const SELECT_ENTRY: &str = r#"
    SELECT seq, id, idempotency_key, intent, target, payload,
           attempt_count, next_attempt_at, status, last_error, created_at
    FROM outbox
"#;

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: i64,
    pub in_flight: i64,
    pub failed_permanent: i64,
}

async fn fetch_entry(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<OutboxEntry>> {
    let row: Option<OutboxRow> = sqlx::query_as(&format!("{SELECT_ENTRY} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(OutboxRow::into_entry).transpose()
}

/// Id of the pending entry holding `key`, other than `except`.
async fn pending_with_key(
    conn: &mut SqliteConnection,
    key: &str,
    except: Option<&str>,
) -> DbResult<Option<String>> {
    let id = sqlx::query_scalar(
        r#"
        SELECT id FROM outbox
        WHERE idempotency_key = ?1 AND status = ?2 AND (?3 IS NULL OR id != ?3)
        "#,
    )
    .bind(key)
    .bind(OutboxStatus::Pending)
    .bind(except)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// Repository for the outbox queue.
///
/// ## Usage
/// ```rust,ignore
/// let outbox = db.outbox();
///
/// outbox.enqueue(&OutboxWrite::new("progress", "lesson-L1-progress", json!({"pct": 80}))).await?;
///
/// for entry in outbox.pending_in_order().await? {
///     // deliver, then complete / defer / mark_failed_permanent
/// }
/// ```
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    /// Creates a new OutboxRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OutboxRepository { pool }
    }

    async fn begin(&self) -> DbResult<sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }

    async fn commit(tx: sqlx::Transaction<'static, sqlx::Sqlite>) -> DbResult<()> {
        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }

    /// Queues a write.
    ///
    /// ## Idempotency
    /// If a `pending` entry with the same idempotency key exists it is
    /// replaced: the new payload takes its id, goes to the tail of the queue
    /// and starts with a fresh attempt count. `in_flight` and
    /// `failed_permanent` entries with that key are left alone.
    ///
    /// ## Returns
    /// The stored entry.
    pub async fn enqueue(&self, write: &OutboxWrite) -> DbResult<OutboxEntry> {
        validate_outbox_write(write)?;

        let mut tx = self.begin().await?;

        let replaced = pending_with_key(&mut tx, &write.idempotency_key, None).await?;
        if let Some(old_id) = &replaced {
            sqlx::query("DELETE FROM outbox WHERE id = ?1")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        let id = replaced
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let payload = encode_json(TABLE, &id, &write.payload)?;

        let seq = sqlx::query(
            r#"
            INSERT INTO outbox (
                id, idempotency_key, intent, target, payload,
                attempt_count, next_attempt_at, status, last_error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, NULL, ?6)
            "#,
        )
        .bind(&id)
        .bind(&write.idempotency_key)
        .bind(&write.intent)
        .bind(write.target_key())
        .bind(payload)
        .bind(now)
        .bind(OutboxStatus::Pending)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        Self::commit(tx).await?;

        debug!(
            entry_id = %id,
            intent = %write.intent,
            key = %write.idempotency_key,
            replaced = replaced.is_some(),
            "Write queued"
        );

        Ok(OutboxEntry {
            id,
            seq,
            idempotency_key: write.idempotency_key.clone(),
            intent: write.intent.clone(),
            target: write.target_key().to_string(),
            payload: write.payload.clone(),
            attempt_count: 0,
            next_attempt_at: now,
            status: OutboxStatus::Pending,
            last_error: None,
            created_at: now,
        })
    }

    /// Gets an entry by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<OutboxEntry>> {
        let mut conn = self.pool.acquire().await?;
        fetch_entry(&mut conn, id).await
    }

    /// All pending entries in insertion order, due or not.
    pub async fn pending_in_order(&self) -> DbResult<Vec<OutboxEntry>> {
        self.list_status(OutboxStatus::Pending).await
    }

    /// Entries parked as `failed_permanent`, oldest first.
    pub async fn failed(&self) -> DbResult<Vec<OutboxEntry>> {
        self.list_status(OutboxStatus::FailedPermanent).await
    }

    async fn list_status(&self, status: OutboxStatus) -> DbResult<Vec<OutboxEntry>> {
        let rows: Vec<OutboxRow> =
            sqlx::query_as(&format!("{SELECT_ENTRY} WHERE status = ?1 ORDER BY seq ASC"))
                .bind(status)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(OutboxRow::into_entry).collect()
    }

    /// Claims a pending entry for delivery.
    ///
    /// ## Returns
    /// `false` if the entry is no longer pending (replaced or removed).
    pub async fn mark_in_flight(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("UPDATE outbox SET status = ?2 WHERE id = ?1 AND status = ?3")
            .bind(id)
            .bind(OutboxStatus::InFlight)
            .bind(OutboxStatus::Pending)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes a delivered entry.
    pub async fn complete(&self, id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM outbox WHERE id = ?1 AND status = ?2")
            .bind(id)
            .bind(OutboxStatus::InFlight)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns an entry to `pending` after a transient failure.
    ///
    /// If a newer pending entry with the same key was queued meanwhile, this
    /// one is superseded and deleted instead.
    ///
    /// ## Arguments
    /// * `id` - Entry id
    /// * `next_attempt_at` - Earliest time of the next attempt
    /// * `error` - Failure description
    pub async fn defer(&self, id: &str, next_attempt_at: DateTime<Utc>, error: &str) -> DbResult<()> {
        let mut tx = self.begin().await?;

        let entry = fetch_entry(&mut tx, id)
            .await?
            .ok_or_else(|| DbError::not_found("Outbox entry", id))?;

        if pending_with_key(&mut tx, &entry.idempotency_key, Some(id))
            .await?
            .is_some()
        {
            sqlx::query("DELETE FROM outbox WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            debug!(entry_id = %id, "Deferred entry superseded by newer write");
        } else {
            sqlx::query(
                r#"
                UPDATE outbox SET
                    status = ?2,
                    attempt_count = attempt_count + 1,
                    next_attempt_at = ?3,
                    last_error = ?4
                WHERE id = ?1
                "#,
            )
            .bind(id)
            .bind(OutboxStatus::Pending)
            .bind(next_attempt_at)
            .bind(error)
            .execute(&mut *tx)
            .await?;
        }

        Self::commit(tx).await
    }

    /// Parks an entry the server will never accept.
    pub async fn mark_failed_permanent(&self, id: &str, error: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox SET
                status = ?2,
                attempt_count = attempt_count + 1,
                last_error = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(OutboxStatus::FailedPermanent)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Outbox entry", id));
        }
        Ok(())
    }

    /// Returns one `in_flight` entry to `pending` without counting an attempt.
    ///
    /// Used when the outcome of a delivery could not be recorded. A newer
    /// pending entry with the same key supersedes this one.
    pub async fn release_in_flight(&self, id: &str) -> DbResult<()> {
        let mut tx = self.begin().await?;

        let Some(entry) = fetch_entry(&mut tx, id).await? else {
            return Self::commit(tx).await;
        };
        if entry.status != OutboxStatus::InFlight {
            return Self::commit(tx).await;
        }

        if pending_with_key(&mut tx, &entry.idempotency_key, Some(id))
            .await?
            .is_some()
        {
            sqlx::query("DELETE FROM outbox WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE outbox SET status = ?2 WHERE id = ?1")
                .bind(id)
                .bind(OutboxStatus::Pending)
                .execute(&mut *tx)
                .await?;
        }

        Self::commit(tx).await
    }

    /// Moves entries interrupted mid-delivery back to `pending`.
    ///
    /// An interrupted entry whose key already has a newer pending entry is
    /// dropped in favour of that entry.
    pub async fn recover_in_flight(&self) -> DbResult<u64> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE status = ?1
              AND idempotency_key IN (SELECT idempotency_key FROM outbox WHERE status = ?2)
            "#,
        )
        .bind(OutboxStatus::InFlight)
        .bind(OutboxStatus::Pending)
        .execute(&mut *tx)
        .await?;

        let recovered = sqlx::query("UPDATE outbox SET status = ?1 WHERE status = ?2")
            .bind(OutboxStatus::Pending)
            .bind(OutboxStatus::InFlight)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        Self::commit(tx).await?;
        Ok(recovered)
    }

    /// Puts a `failed_permanent` entry back in the queue, due now.
    ///
    /// ## Returns
    /// The entry that will carry the write: this one, or a newer pending
    /// entry with the same key (the failed one is then dropped).
    pub async fn retry_failed(&self, id: &str) -> DbResult<OutboxEntry> {
        let mut tx = self.begin().await?;

        let entry = fetch_entry(&mut tx, id)
            .await?
            .filter(|e| e.status == OutboxStatus::FailedPermanent)
            .ok_or_else(|| DbError::not_found("Failed write", id))?;

        let survivor_id = match pending_with_key(&mut tx, &entry.idempotency_key, Some(id)).await? {
            Some(newer) => {
                sqlx::query("DELETE FROM outbox WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                newer
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE outbox SET
                        status = ?2,
                        attempt_count = 0,
                        next_attempt_at = ?3,
                        last_error = NULL
                    WHERE id = ?1
                    "#,
                )
                .bind(id)
                .bind(OutboxStatus::Pending)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                id.to_string()
            }
        };

        let survivor = fetch_entry(&mut tx, &survivor_id)
            .await?
            .ok_or_else(|| DbError::not_found("Outbox entry", &survivor_id))?;

        Self::commit(tx).await?;
        Ok(survivor)
    }

    /// Drops a `failed_permanent` entry for good.
    ///
    /// ## Returns
    /// The removed entry.
    pub async fn abandon(&self, id: &str) -> DbResult<OutboxEntry> {
        let mut tx = self.begin().await?;

        let entry = fetch_entry(&mut tx, id)
            .await?
            .filter(|e| e.status == OutboxStatus::FailedPermanent)
            .ok_or_else(|| DbError::not_found("Failed write", id))?;

        sqlx::query("DELETE FROM outbox WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        Self::commit(tx).await?;
        Ok(entry)
    }

    /// Entry counts per status.
    pub async fn count_by_status(&self) -> DbResult<OutboxCounts> {
        let rows: Vec<(OutboxStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = OutboxCounts::default();
        for (status, count) in rows {
            match status {
                OutboxStatus::Pending => counts.pending = count,
                OutboxStatus::InFlight => counts.in_flight = count,
                OutboxStatus::FailedPermanent => counts.failed_permanent = count,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;
    use serde_json::json;

    async fn outbox() -> OutboxRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        db.outbox()
    }

    fn write(key: &str, pct: i64) -> OutboxWrite {
        OutboxWrite::new("progress", key, json!({ "pct": pct })).for_target("lesson:L1")
    }

    #[tokio::test]
    async fn test_enqueue_preserves_fifo_order() {
        let outbox = outbox().await;
        let a = outbox.enqueue(&write("k1", 10)).await.unwrap();
        let b = outbox.enqueue(&write("k2", 20)).await.unwrap();
        let c = outbox.enqueue(&write("k3", 30)).await.unwrap();

        let ids: Vec<_> = outbox
            .pending_in_order()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert!(a.seq < b.seq && b.seq < c.seq);
    }

    #[tokio::test]
    async fn test_release_in_flight_returns_entry_to_queue() {
        let outbox = outbox().await;
        let a = outbox.enqueue(&write("k1", 10)).await.unwrap();
        assert!(outbox.mark_in_flight(&a.id).await.unwrap());
        assert!(outbox.pending_in_order().await.unwrap().is_empty());

        outbox.release_in_flight(&a.id).await.unwrap();
        let pending = outbox.pending_in_order().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(pending[0].attempt_count, 0);

        // Already pending: nothing changes.
        outbox.release_in_flight(&a.id).await.unwrap();
        assert_eq!(outbox.pending_in_order().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_same_key_replaces_pending() {
        let outbox = outbox().await;
        let first = outbox.enqueue(&write("k1", 10)).await.unwrap();
        let other = outbox.enqueue(&write("k2", 20)).await.unwrap();
        let second = outbox.enqueue(&write("k1", 90)).await.unwrap();

        assert_eq!(first.id, second.id);
        let pending = outbox.pending_in_order().await.unwrap();
        assert_eq!(pending.len(), 2);
        // Replacement moves to the tail.
        assert_eq!(pending[0].id, other.id);
        assert_eq!(pending[1].payload, json!({ "pct": 90 }));
    }

    #[tokio::test]
    async fn test_target_defaults_to_intent() {
        let outbox = outbox().await;
        let entry = outbox
            .enqueue(&OutboxWrite::new("bookmark", "b1", json!({})))
            .await
            .unwrap();
        assert_eq!(entry.target, "bookmark");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_blank_key() {
        let outbox = outbox().await;
        assert!(outbox.enqueue(&write(" ", 1)).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_in_flight_then_complete() {
        let outbox = outbox().await;
        let entry = outbox.enqueue(&write("k1", 10)).await.unwrap();

        assert!(outbox.mark_in_flight(&entry.id).await.unwrap());
        assert!(!outbox.mark_in_flight(&entry.id).await.unwrap());
        assert!(outbox.pending_in_order().await.unwrap().is_empty());

        outbox.complete(&entry.id).await.unwrap();
        assert!(outbox.get(&entry.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_defer_increments_attempts() {
        let outbox = outbox().await;
        let entry = outbox.enqueue(&write("k1", 10)).await.unwrap();
        outbox.mark_in_flight(&entry.id).await.unwrap();

        let later = Utc::now() + Duration::seconds(30);
        outbox.defer(&entry.id, later, "503").await.unwrap();

        let stored = outbox.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("503"));
        assert!(!stored.is_due(Utc::now()));
    }

    #[tokio::test]
    async fn test_defer_superseded_by_newer_write() {
        let outbox = outbox().await;
        let entry = outbox.enqueue(&write("k1", 10)).await.unwrap();
        outbox.mark_in_flight(&entry.id).await.unwrap();

        // Learner updates progress while the old value is on the wire.
        let newer = outbox.enqueue(&write("k1", 60)).await.unwrap();
        assert_ne!(newer.id, entry.id);

        outbox.defer(&entry.id, Utc::now(), "timeout").await.unwrap();

        let pending = outbox.pending_in_order().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, newer.id);
    }

    #[tokio::test]
    async fn test_recover_in_flight() {
        let outbox = outbox().await;
        let entry = outbox.enqueue(&write("k1", 10)).await.unwrap();
        outbox.mark_in_flight(&entry.id).await.unwrap();

        assert_eq!(outbox.recover_in_flight().await.unwrap(), 1);
        let stored = outbox.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_permanent_retry_and_abandon() {
        let outbox = outbox().await;
        let a = outbox.enqueue(&write("k1", 10)).await.unwrap();
        let b = outbox.enqueue(&write("k2", 20)).await.unwrap();
        outbox.mark_in_flight(&a.id).await.unwrap();
        outbox.mark_failed_permanent(&a.id, "422 invalid").await.unwrap();
        outbox.mark_in_flight(&b.id).await.unwrap();
        outbox.mark_failed_permanent(&b.id, "400 bad").await.unwrap();

        let counts = outbox.count_by_status().await.unwrap();
        assert_eq!(counts.failed_permanent, 2);
        assert_eq!(counts.pending, 0);

        let failed = outbox.failed().await.unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("422 invalid"));

        let retried = outbox.retry_failed(&a.id).await.unwrap();
        assert_eq!(retried.status, OutboxStatus::Pending);
        assert_eq!(retried.attempt_count, 0);

        let abandoned = outbox.abandon(&b.id).await.unwrap();
        assert_eq!(abandoned.id, b.id);
        assert!(outbox.get(&b.id).await.unwrap().is_none());

        // Only failed entries can be retried or abandoned.
        assert!(outbox.abandon(&a.id).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_entry_kept_when_key_requeued() {
        let outbox = outbox().await;
        let a = outbox.enqueue(&write("k1", 10)).await.unwrap();
        outbox.mark_in_flight(&a.id).await.unwrap();
        outbox.mark_failed_permanent(&a.id, "rejected").await.unwrap();

        let fresh = outbox.enqueue(&write("k1", 11)).await.unwrap();
        assert_ne!(fresh.id, a.id);
        assert_eq!(outbox.failed().await.unwrap().len(), 1);

        // Retrying the old one defers to the newer pending write.
        let survivor = outbox.retry_failed(&a.id).await.unwrap();
        assert_eq!(survivor.id, fresh.id);
        assert!(outbox.failed().await.unwrap().is_empty());
    }
}
