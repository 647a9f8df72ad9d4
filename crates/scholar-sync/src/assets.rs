//! # Asset Resolver
//!
//! Maps an asset id to a usable local file, downloading on demand.
//!
//! ## Resolve Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         resolve(asset_id)                               │
//! │                                                                         │
//! │  row.status = cached ──► file on disk? ──yes──► return local path      │
//! │                               │                                         │
//! │                               no → mark missing, fall through          │
//! │                                                                         │
//! │  missing | failed | downloading                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  download already running for this id? ──yes──► wait on it            │
//! │       │                                                                 │
//! │       no                                                                │
//! │       ▼                                                                 │
//! │  mark downloading → fetch remote_url → verify size + sha256            │
//! │       → write <dir>/<sha256(id)>.part → rename to <dir>/<sha256(id)>   │
//! │       → mark cached (only if remote_url is unchanged)                  │
//! │                                                                         │
//! │  Any failure → mark failed, return CacheError { kind: asset }.         │
//! │  There is no automatic retry; the next resolve() tries once more.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use scholar_core::{AssetRecord, AssetStatus, CacheMode, DownloadStatus};
use scholar_db::{Database, DbError};

use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEventEmitter, NoOpEmitter};
use crate::remote::AssetFetcher;
use crate::tasks::{SharedTask, TaskRegistry};

const PART_SUFFIX: &str = ".part";

/// Resolves media references to local files.
///
/// Clone is cheap; clones share the download registry.
#[derive(Clone)]
pub struct AssetResolver {
    db: Database,
    fetcher: Arc<dyn AssetFetcher>,
    assets_dir: PathBuf,
    emitter: Arc<dyn CacheEventEmitter>,
    downloads: TaskRegistry<String, PathBuf>,
    prefetches: TaskRegistry<String, DownloadStatus>,
}

impl AssetResolver {
    /// Creates a resolver storing files under `assets_dir`.
    pub fn new(db: Database, fetcher: Arc<dyn AssetFetcher>, assets_dir: impl Into<PathBuf>) -> Self {
        Self::with_emitter(db, fetcher, assets_dir, Arc::new(NoOpEmitter))
    }

    /// Creates a resolver with a custom event emitter.
    pub fn with_emitter(
        db: Database,
        fetcher: Arc<dyn AssetFetcher>,
        assets_dir: impl Into<PathBuf>,
        emitter: Arc<dyn CacheEventEmitter>,
    ) -> Self {
        AssetResolver {
            db,
            fetcher,
            assets_dir: assets_dir.into(),
            emitter,
            downloads: TaskRegistry::new("downloads"),
            prefetches: TaskRegistry::new("prefetches"),
        }
    }

    /// Directory holding downloaded files.
    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    /// Deterministic local path of an asset.
    pub fn path_for(&self, asset_id: &str) -> PathBuf {
        self.assets_dir.join(file_name_for(asset_id))
    }

    // =========================================================================
    // Resolve
    // =========================================================================

    /// Returns the local file of an asset, downloading it if needed.
    ///
    /// ## Errors
    /// - `validation` if no asset row has this id
    /// - `asset` if the download or its verification failed
    /// - `storage` if the store could not be read or updated
    pub async fn resolve(&self, asset_id: &str) -> CacheResult<PathBuf> {
        let record = self
            .db
            .assets()
            .get(asset_id)
            .await?
            .ok_or_else(|| CacheError::validation(format!("Unknown asset: {}", asset_id)))?;

        if record.status == AssetStatus::Cached {
            if let Some(uri) = &record.local_uri {
                if fs::try_exists(uri).await.unwrap_or(false) {
                    return Ok(PathBuf::from(uri));
                }
            }
            warn!(asset_id = %asset_id, "Cached asset file is gone; downloading again");
            self.db.assets().mark_missing(asset_id).await?;
        }

        self.download(record).await
    }

    /// Starts (or joins) the download of one asset.
    fn download(&self, record: AssetRecord) -> SharedTask<PathBuf> {
        let resolver = self.clone();
        let (task, joined) = self
            .downloads
            .run_or_join(record.id.clone(), move || async move {
                resolver.download_now(record).await
            });
        if joined {
            debug!("Waiting on download already in flight");
        }
        task
    }

    async fn download_now(&self, record: AssetRecord) -> CacheResult<PathBuf> {
        let assets = self.db.assets();
        assets.mark_downloading(&record.id).await?;

        let path = self.path_for(&record.id);
        let outcome = match self.fetch_verified(&record, &path).await {
            Ok(size) => {
                let uri = path.to_string_lossy();
                if assets.mark_cached(&record.id, &record.remote_url, &uri, size).await? {
                    info!(asset_id = %record.id, size, "Asset cached");
                    Ok(path)
                } else {
                    // Replaced or deleted by a sync while downloading.
                    remove_file_quietly(&path).await;
                    Err(CacheError::asset(format!(
                        "Asset {} changed while downloading",
                        record.id
                    )))
                }
            }
            Err(e) => {
                warn!(asset_id = %record.id, error = %e, "Asset download failed");
                match assets.mark_failed(&record.id).await {
                    Ok(()) | Err(DbError::NotFound { .. }) => {}
                    Err(db_err) => return Err(db_err.into()),
                }
                Err(e)
            }
        };

        self.emitter
            .asset_resolved(&record.id, outcome.as_ref().map(PathBuf::as_path));
        outcome
    }

    /// Downloads, verifies and atomically stores the bytes.
    ///
    /// ## Returns
    /// Size of the stored file.
    async fn fetch_verified(&self, record: &AssetRecord, path: &Path) -> CacheResult<i64> {
        let bytes = self.fetcher.fetch(&record.remote_url).await.map_err(|e| {
            CacheError::asset(format!("Download of {} failed: {}", record.id, e))
        })?;

        if bytes.is_empty() {
            return Err(CacheError::asset(format!("Asset {} is empty", record.id)));
        }

        let size = bytes.len() as i64;
        if let Some(expected) = record.size {
            if expected != size {
                return Err(CacheError::asset(format!(
                    "Size mismatch for {}: expected {}, got {}",
                    record.id, expected, size
                )));
            }
        }

        if let Some(expected) = &record.checksum {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(CacheError::asset(format!(
                    "Checksum mismatch for {}",
                    record.id
                )));
            }
        }

        fs::create_dir_all(&self.assets_dir).await?;

        let mut part = path.as_os_str().to_owned();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        fs::write(&part, &bytes).await?;
        fs::rename(&part, path).await?;

        Ok(size)
    }

    // =========================================================================
    // Unit-level Operations
    // =========================================================================

    /// Downloads every non-cached asset of a unit and its lessons.
    ///
    /// Sets the unit's `download_status` to `downloading`, then to `ready`
    /// or `failed` once all downloads have finished.
    ///
    /// ## Returns
    /// The final download status.
    pub async fn prefetch_unit(&self, unit_id: &str) -> CacheResult<DownloadStatus> {
        let units = self.db.units();
        units.set_download_status(unit_id, DownloadStatus::Downloading).await?;

        let asset_ids: Vec<String> = self
            .db
            .assets()
            .list_for_unit(unit_id)
            .await?
            .into_iter()
            .map(|asset| asset.id)
            .collect();

        debug!(unit_id = %unit_id, assets = asset_ids.len(), "Prefetching unit media");

        // Cached rows short-circuit in resolve(); a vanished file is fetched again.
        let results = join_all(asset_ids.iter().map(|id| self.resolve(id))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();

        let status = if failed == 0 {
            DownloadStatus::Ready
        } else {
            DownloadStatus::Failed
        };

        // The learner may have cleared the unit or dropped it to minimal meanwhile.
        match units.get(unit_id).await? {
            None => return Ok(status),
            Some(unit) if unit.cache_mode == CacheMode::Minimal => {
                self.evict_unit(unit_id).await?;
                units.set_download_status(unit_id, DownloadStatus::Idle).await?;
                return Ok(DownloadStatus::Idle);
            }
            Some(_) => {}
        }

        units.set_download_status(unit_id, status).await?;
        info!(unit_id = %unit_id, ?status, failed, "Unit prefetch finished");

        Ok(status)
    }

    /// Starts (or joins) a background prefetch of a unit.
    pub fn spawn_prefetch(&self, unit_id: &str) -> SharedTask<DownloadStatus> {
        let resolver = self.clone();
        let id = unit_id.to_string();
        let (task, _) = self
            .prefetches
            .run_or_join(unit_id.to_string(), move || async move {
                resolver.prefetch_unit(&id).await
            });
        task
    }

    /// Deletes a unit's files and resets its assets to `missing`.
    ///
    /// ## Returns
    /// Number of files removed from disk.
    pub async fn evict_unit(&self, unit_id: &str) -> CacheResult<usize> {
        let files = self.db.assets().reset_unit(unit_id).await?;
        let removed = self.remove_files(&files).await;
        info!(unit_id = %unit_id, removed, "Unit media evicted");
        Ok(removed)
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Deletes files by local URI. Files already gone are not an error.
    ///
    /// ## Returns
    /// Number of files actually removed.
    pub async fn remove_files(&self, uris: &[String]) -> usize {
        let mut removed = 0;
        for uri in uris {
            match fs::remove_file(uri).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %uri, error = %e, "Failed to delete asset file"),
            }
        }
        removed
    }

    /// Deletes files in the assets directory that no row points at
    /// (leftover `.part` files, files of purged rows).
    ///
    /// ## Returns
    /// Number of files removed.
    pub async fn remove_orphans(&self) -> CacheResult<usize> {
        let referenced: HashSet<PathBuf> = self
            .db
            .assets()
            .local_files()
            .await?
            .into_iter()
            .map(PathBuf::from)
            .collect();

        let mut removed = 0;
        for path in self.list_files().await? {
            if referenced.contains(&path) {
                continue;
            }
            // Leave files a running download is about to claim.
            if path.to_string_lossy().ends_with(PART_SUFFIX) && !self.downloads.is_empty() {
                continue;
            }
            if fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Removed orphaned asset files");
        }
        Ok(removed)
    }

    /// Total bytes of files in the assets directory.
    pub async fn disk_usage(&self) -> CacheResult<u64> {
        let mut total = 0;
        for path in self.list_files().await? {
            if let Ok(meta) = fs::metadata(&path).await {
                total += meta.len();
            }
        }
        Ok(total)
    }

    async fn list_files(&self) -> CacheResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.assets_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

/// File name for an asset id: lowercase hex SHA-256 of the id.
///
/// Distinct ids never share a file, and no id can escape `assets_dir`.
fn file_name_for(asset_id: &str) -> String {
    hex::encode(Sha256::digest(asset_id.as_bytes()))
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!(file = %path.display(), error = %e, "Could not remove file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheErrorKind, RemoteError};
    use async_trait::async_trait;
    use scholar_core::{RemoteAssetMeta, UnitPayload, UnitRecord};
    use scholar_db::DbConfig;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Serves canned bodies and counts requests per URL.
    #[derive(Default)]
    struct FakeFetcher {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        calls: Mutex<HashMap<String, usize>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeFetcher {
        fn serve(&self, url: &str, body: &[u8]) {
            self.bodies.lock().unwrap().insert(url.to_string(), body.to_vec());
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl AssetFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
            *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.bodies
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| RemoteError::from_status(404, "not found"))
        }
    }

    const URL: &str = "https://cdn.example.com/a1.png";

    async fn setup(fetcher: Arc<FakeFetcher>, meta: RemoteAssetMeta) -> (AssetResolver, tempfile::TempDir) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        db.units()
            .upsert(&UnitRecord::new("u1", UnitPayload::titled("Fractions"), 3))
            .await
            .unwrap();
        db.assets().upsert_remote("u1", "u1", &meta).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let resolver = AssetResolver::new(db, fetcher, dir.path().join("assets"));
        (resolver, dir)
    }

    fn meta(checksum: Option<String>, size: Option<i64>) -> RemoteAssetMeta {
        RemoteAssetMeta {
            id: "a1".into(),
            remote_url: URL.into(),
            checksum,
            size,
        }
    }

    #[test]
    fn test_file_name_for_is_stable_and_contained() {
        assert_eq!(file_name_for("a1"), file_name_for("a1"));
        assert_eq!(file_name_for("../etc/passwd").len(), 64);
        assert!(!file_name_for("../etc/passwd").contains('/'));
        assert_ne!(file_name_for("img/1"), file_name_for("img_1"));
        assert_ne!(file_name_for("img:1"), file_name_for("img_1"));
    }

    #[tokio::test]
    async fn test_similar_ids_get_separate_files() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve("https://cdn.example.com/a.png", b"slash asset");
        fetcher.serve("https://cdn.example.com/b.png", b"underscore asset");
        let (resolver, _dir) = setup(Arc::clone(&fetcher), meta(None, None)).await;
        for (id, url) in [
            ("img/1", "https://cdn.example.com/a.png"),
            ("img_1", "https://cdn.example.com/b.png"),
        ] {
            let meta = RemoteAssetMeta {
                id: id.into(),
                remote_url: url.into(),
                checksum: None,
                size: None,
            };
            resolver.db.assets().upsert_remote("u1", "u1", &meta).await.unwrap();
        }

        let slash = resolver.resolve("img/1").await.unwrap();
        let underscore = resolver.resolve("img_1").await.unwrap();
        assert_ne!(slash, underscore);
        assert!(slash.starts_with(resolver.assets_dir()));

        assert_eq!(std::fs::read(resolver.resolve("img/1").await.unwrap()).unwrap(), b"slash asset");
        assert_eq!(std::fs::read(&underscore).unwrap(), b"underscore asset");
    }

    #[tokio::test]
    async fn test_resolve_downloads_then_serves_locally() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(URL, b"png!");
        let (resolver, _dir) = setup(Arc::clone(&fetcher), meta(None, Some(4))).await;

        let path = resolver.resolve("a1").await.unwrap();
        assert_eq!(path, resolver.path_for("a1"));
        assert_eq!(std::fs::read(&path).unwrap(), b"png!");

        let again = resolver.resolve("a1").await.unwrap();
        assert_eq!(again, path);
        assert_eq!(fetcher.calls(URL), 1);

        let row = resolver.db.assets().get("a1").await.unwrap().unwrap();
        assert!(row.is_cached());
        assert_eq!(resolver.disk_usage().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_file_heals() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(URL, b"png!");
        let (resolver, _dir) = setup(Arc::clone(&fetcher), meta(None, None)).await;

        let path = resolver.resolve("a1").await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let healed = resolver.resolve("a1").await.unwrap();
        assert!(healed.exists());
        assert_eq!(fetcher.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_marks_failed() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(URL, b"png!");
        let wrong = hex::encode(Sha256::digest(b"other"));
        let (resolver, _dir) = setup(Arc::clone(&fetcher), meta(Some(wrong), None)).await;

        let err = resolver.resolve("a1").await.unwrap_err();
        assert_eq!(err.kind, CacheErrorKind::Asset);

        let row = resolver.db.assets().get("a1").await.unwrap().unwrap();
        assert_eq!(row.status, AssetStatus::Failed);
        assert!(!resolver.path_for("a1").exists());

        // No automatic retry: only an explicit resolve fetches again.
        assert_eq!(fetcher.calls(URL), 1);
        let _ = resolver.resolve("a1").await;
        assert_eq!(fetcher.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_matching_checksum_is_accepted() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(URL, b"png!");
        let checksum = hex::encode(Sha256::digest(b"png!")).to_uppercase();
        let (resolver, _dir) = setup(fetcher, meta(Some(checksum), Some(4))).await;

        assert!(resolver.resolve("a1").await.is_ok());
    }

    #[tokio::test]
    async fn test_size_mismatch_fails() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(URL, b"png!");
        let (resolver, _dir) = setup(fetcher, meta(None, Some(10))).await;

        let err = resolver.resolve("a1").await.unwrap_err();
        assert!(err.message.contains("Size mismatch"));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_download() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(FakeFetcher {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        fetcher.serve(URL, b"png!");
        let (resolver, _dir) = setup(Arc::clone(&fetcher), meta(None, None)).await;

        let first = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("a1").await }
        });
        let second = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("a1").await }
        });

        while fetcher.calls(URL) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        gate.notify_one();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(fetcher.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_prefetch_and_evict_unit() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(URL, b"png!");
        let (resolver, _dir) = setup(fetcher, meta(None, None)).await;
        resolver.db.units().set_cache_mode("u1", CacheMode::Full).await.unwrap();

        let status = resolver.spawn_prefetch("u1").await.unwrap();
        assert_eq!(status, DownloadStatus::Ready);
        let unit = resolver.db.units().get("u1").await.unwrap().unwrap();
        assert_eq!(unit.download_status, DownloadStatus::Ready);

        let path = resolver.path_for("a1");
        assert!(path.exists());

        assert_eq!(resolver.evict_unit("u1").await.unwrap(), 1);
        assert!(!path.exists());
        let row = resolver.db.assets().get("a1").await.unwrap().unwrap();
        assert_eq!(row.status, AssetStatus::Missing);
    }

    #[tokio::test]
    async fn test_prefetch_reports_failure() {
        let fetcher = Arc::new(FakeFetcher::default());
        let (resolver, _dir) = setup(fetcher, meta(None, None)).await;
        resolver.db.units().set_cache_mode("u1", CacheMode::Full).await.unwrap();

        let status = resolver.prefetch_unit("u1").await.unwrap();
        assert_eq!(status, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_remove_orphans_keeps_referenced_files() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.serve(URL, b"png!");
        let (resolver, _dir) = setup(fetcher, meta(None, None)).await;

        let kept = resolver.resolve("a1").await.unwrap();
        let stray = resolver.assets_dir().join("old-asset");
        std::fs::write(&stray, b"stale").unwrap();

        assert_eq!(resolver.remove_orphans().await.unwrap(), 1);
        assert!(kept.exists());
        assert!(!stray.exists());
    }
}
