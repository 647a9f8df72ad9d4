//! # Apply Delta
//!
//! Writes one pulled delta to the store in a single transaction.
//!
//! ## Transaction Boundary
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      BEGIN                                              │
//! │                                                                         │
//! │  1. units      upsert payload, keep cache_mode/download_status         │
//! │                merge unit-level asset metadata                         │
//! │  2. lessons    upsert when the parent unit is stored, else skip        │
//! │                merge lesson-level asset metadata                       │
//! │  3. deletions  unit (cascade) | lesson (+ owned assets) | asset        │
//! │  4. cursor     cache_metadata.last_sync_cursor = delta.cursor          │
//! │                                                                         │
//! │                      COMMIT                                             │
//! │                                                                         │
//! │  Any storage error rolls everything back, the cursor included, so     │
//! │  the next cycle pulls the same delta again.                            │
//! │  Stale files are only reported; they are deleted after COMMIT.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use scholar_core::validation::{validate_asset, validate_lesson, validate_unit};
use scholar_core::{
    merge_remote_asset, LessonRecord, MetadataUpdate, PulledDelta, RemoteAssetMeta, UnitRecord,
};

use super::asset::{fetch_asset, remove_asset, write_asset};
use super::lesson::{remove_lesson, write_lesson};
use super::metadata::write_metadata;
use super::unit::{fetch_unit, remove_unit, write_unit};
use crate::error::{DbError, DbResult};

/// What an applied delta changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub units_upserted: usize,
    pub lessons_upserted: usize,
    /// Assets that are new or whose content changed remotely.
    pub assets_updated: usize,
    pub deleted: usize,
    /// Local files no longer referenced by any row.
    pub stale_files: Vec<String>,
    /// Lessons whose unit is not stored locally.
    pub skipped_orphans: Vec<String>,
    /// Rows that failed validation.
    pub skipped_invalid: Vec<String>,
}

impl ApplySummary {
    /// True if any pulled row was not applied.
    pub fn has_skips(&self) -> bool {
        !self.skipped_orphans.is_empty() || !self.skipped_invalid.is_empty()
    }
}

/// Applies a pulled delta atomically.
///
/// ## Arguments
/// * `pool` - Store pool
/// * `delta` - Pulled changes
/// * `schema_version` - Version stamped on written units
pub async fn apply_delta(
    pool: &SqlitePool,
    delta: &PulledDelta,
    schema_version: i64,
) -> DbResult<ApplySummary> {
    let now = Utc::now();
    let mut summary = ApplySummary::default();

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

    for pulled in &delta.units {
        let base = match fetch_unit(&mut tx, &pulled.id).await? {
            Some(existing) => existing,
            None => UnitRecord::new(&pulled.id, pulled.payload.clone(), schema_version),
        };
        let record = base.with_remote_payload(pulled.payload.clone(), pulled.mode, schema_version, now);

        if let Err(e) = validate_unit(&record) {
            warn!(unit_id = %pulled.id, error = %e, "Skipping invalid pulled unit");
            summary.skipped_invalid.push(pulled.id.clone());
            continue;
        }

        write_unit(&mut tx, &record).await?;
        summary.units_upserted += 1;

        merge_assets(&mut tx, &pulled.id, &pulled.id, &pulled.assets, &mut summary).await?;
    }

    for pulled in &delta.lessons {
        if fetch_unit(&mut tx, &pulled.unit_id).await?.is_none() {
            warn!(
                lesson_id = %pulled.id,
                unit_id = %pulled.unit_id,
                "Skipping lesson whose unit is not cached"
            );
            summary.skipped_orphans.push(pulled.id.clone());
            continue;
        }

        let record = LessonRecord {
            id: pulled.id.clone(),
            unit_id: pulled.unit_id.clone(),
            payload: pulled.payload.clone(),
            synced_at: Some(now),
        };

        if let Err(e) = validate_lesson(&record) {
            warn!(lesson_id = %pulled.id, error = %e, "Skipping invalid pulled lesson");
            summary.skipped_invalid.push(pulled.id.clone());
            continue;
        }

        write_lesson(&mut tx, &record).await?;
        summary.lessons_upserted += 1;

        merge_assets(&mut tx, &pulled.unit_id, &pulled.id, &pulled.assets, &mut summary).await?;
    }

    for id in &delta.deleted_ids {
        let removed = match remove_unit(&mut tx, id).await? {
            Some(files) => Some(files),
            None => match remove_lesson(&mut tx, id).await? {
                Some(files) => Some(files),
                None => remove_asset(&mut tx, id).await?,
            },
        };

        match removed {
            Some(files) => {
                summary.deleted += 1;
                summary.stale_files.extend(files);
            }
            None => debug!(id = %id, "Deleted id not present locally"),
        }
    }

    if let Some(cursor) = &delta.cursor {
        write_metadata(&mut tx, &MetadataUpdate::default().cursor(Some(cursor.clone()))).await?;
    }

    tx.commit()
        .await
        .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

    info!(
        units = summary.units_upserted,
        lessons = summary.lessons_upserted,
        assets = summary.assets_updated,
        deleted = summary.deleted,
        skipped = summary.skipped_orphans.len() + summary.skipped_invalid.len(),
        "Delta applied"
    );

    Ok(summary)
}

async fn merge_assets(
    conn: &mut SqliteConnection,
    unit_id: &str,
    owner_id: &str,
    incoming: &[RemoteAssetMeta],
    summary: &mut ApplySummary,
) -> DbResult<()> {
    for meta in incoming {
        let existing = fetch_asset(conn, &meta.id).await?;
        let is_new = existing.is_none();
        let merge = merge_remote_asset(existing.as_ref(), meta, unit_id, owner_id);

        if let Err(e) = validate_asset(&merge.record) {
            warn!(asset_id = %meta.id, error = %e, "Skipping invalid pulled asset");
            summary.skipped_invalid.push(meta.id.clone());
            continue;
        }

        write_asset(conn, &merge.record).await?;

        if is_new || merge.content_changed {
            summary.assets_updated += 1;
        }
        if let Some(stale) = merge.stale_local_uri {
            summary.stale_files.push(stale);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use scholar_core::{
        AssetStatus, CacheMode, DownloadStatus, LessonPayload, PulledLesson, PulledUnit,
        UnitPayload,
    };

    async fn db() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn asset(id: &str, url: &str) -> RemoteAssetMeta {
        RemoteAssetMeta {
            id: id.into(),
            remote_url: url.into(),
            checksum: None,
            size: None,
        }
    }

    fn pulled_unit(id: &str, title: &str, assets: Vec<RemoteAssetMeta>) -> PulledUnit {
        PulledUnit {
            id: id.into(),
            mode: CacheMode::Minimal,
            payload: UnitPayload::titled(title),
            assets,
        }
    }

    fn pulled_lesson(id: &str, unit_id: &str) -> PulledLesson {
        PulledLesson {
            id: id.into(),
            unit_id: unit_id.into(),
            payload: LessonPayload::titled("Intro", 0),
            assets: vec![asset("a-l", "https://cdn.example.com/l.mp3")],
        }
    }

    #[tokio::test]
    async fn test_apply_delta_writes_everything_and_cursor() {
        let db = db().await;
        let delta = PulledDelta {
            cursor: Some("c1".into()),
            units: vec![pulled_unit("u1", "Fractions", vec![asset("a-u", "https://cdn.example.com/u.png")])],
            lessons: vec![pulled_lesson("L1", "u1")],
            deleted_ids: vec![],
        };

        let summary = db.apply_delta(&delta).await.unwrap();
        assert_eq!(summary.units_upserted, 1);
        assert_eq!(summary.lessons_upserted, 1);
        assert_eq!(summary.assets_updated, 2);
        assert!(!summary.has_skips());

        let assets = db.assets().list_for_unit("u1").await.unwrap();
        assert_eq!(assets.len(), 2);
        assert!(assets.iter().all(|a| a.status == AssetStatus::Missing));
        assert_eq!(db.metadata().cursor().await.unwrap().as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_apply_delta_keeps_local_choices() {
        let db = db().await;
        db.apply_delta(&PulledDelta {
            cursor: Some("c1".into()),
            units: vec![pulled_unit("u1", "Fractions", vec![])],
            ..Default::default()
        })
        .await
        .unwrap();
        db.units().set_cache_mode("u1", CacheMode::Full).await.unwrap();
        db.units().set_download_status("u1", DownloadStatus::Ready).await.unwrap();

        db.apply_delta(&PulledDelta {
            cursor: Some("c2".into()),
            units: vec![pulled_unit("u1", "Fractions II", vec![])],
            ..Default::default()
        })
        .await
        .unwrap();

        let unit = db.units().get("u1").await.unwrap().unwrap();
        assert_eq!(unit.title, "Fractions II");
        assert_eq!(unit.cache_mode, CacheMode::Full);
        assert_eq!(unit.download_status, DownloadStatus::Ready);
        assert!(unit.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_orphan_lesson_is_skipped() {
        let db = db().await;
        let summary = db
            .apply_delta(&PulledDelta {
                cursor: Some("c1".into()),
                lessons: vec![pulled_lesson("L9", "ghost")],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.skipped_orphans, vec!["L9".to_string()]);
        assert!(db.lessons().get("L9").await.unwrap().is_none());
        // The rest of the delta still lands.
        assert_eq!(db.metadata().cursor().await.unwrap().as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_deleted_ids_cover_units_lessons_and_assets() {
        let db = db().await;
        db.apply_delta(&PulledDelta {
            cursor: Some("c1".into()),
            units: vec![
                pulled_unit("u1", "Fractions", vec![asset("a1", "https://cdn.example.com/1.png")]),
                pulled_unit("u2", "Decimals", vec![asset("a2", "https://cdn.example.com/2.png")]),
            ],
            lessons: vec![pulled_lesson("L1", "u1")],
            deleted_ids: vec![],
        })
        .await
        .unwrap();
        db.assets()
            .mark_cached("a2", "https://cdn.example.com/2.png", "/cache/a2", 5)
            .await
            .unwrap();

        let summary = db
            .apply_delta(&PulledDelta {
                cursor: Some("c2".into()),
                deleted_ids: vec!["L1".into(), "a2".into(), "nope".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.stale_files, vec!["/cache/a2".to_string()]);
        assert!(db.lessons().get("L1").await.unwrap().is_none());
        assert!(db.assets().get("a-l").await.unwrap().is_none());
        assert!(db.units().get("u1").await.unwrap().is_some());

        db.apply_delta(&PulledDelta {
            cursor: Some("c3".into()),
            deleted_ids: vec!["u1".into()],
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(db.units().get("u1").await.unwrap().is_none());
        assert!(db.assets().get("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_asset_reports_stale_file() {
        let db = db().await;
        let url = "https://cdn.example.com/1.png";
        db.apply_delta(&PulledDelta {
            units: vec![pulled_unit("u1", "Fractions", vec![asset("a1", url)])],
            ..Default::default()
        })
        .await
        .unwrap();
        db.assets().mark_cached("a1", url, "/cache/a1", 5).await.unwrap();

        // Same metadata again: file kept.
        let summary = db
            .apply_delta(&PulledDelta {
                units: vec![pulled_unit("u1", "Fractions", vec![asset("a1", url)])],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.assets_updated, 0);
        assert!(db.assets().get("a1").await.unwrap().unwrap().is_cached());

        // New URL: file reported stale, row reset.
        let summary = db
            .apply_delta(&PulledDelta {
                units: vec![pulled_unit(
                    "u1",
                    "Fractions",
                    vec![asset("a1", "https://cdn.example.com/1-v2.png")],
                )],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.assets_updated, 1);
        assert_eq!(summary.stale_files, vec!["/cache/a1".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_rows_are_skipped() {
        let db = db().await;
        let summary = db
            .apply_delta(&PulledDelta {
                units: vec![
                    pulled_unit("u1", "", vec![]),
                    pulled_unit(
                        "u2",
                        "Decimals",
                        vec![
                            asset("a1", "not-a-url"),
                            asset("a2", "file:///sdcard/a2.png"),
                            asset("a3", "https://cdn.example.com/a3.png"),
                        ],
                    ),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.units_upserted, 1);
        assert_eq!(
            summary.skipped_invalid,
            vec!["u1".to_string(), "a1".to_string(), "a2".to_string()]
        );
        assert!(db.assets().get("a2").await.unwrap().is_none());
        assert!(db.assets().get("a3").await.unwrap().is_some());
    }
}
