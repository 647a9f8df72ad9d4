//! # Cache Service
//!
//! The facade UI screens talk to. Reads are served from the local store;
//! network work runs in the background and is shared between callers.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CacheService                                   │
//! │                                                                         │
//! │   UI screens ──► get_unit / list_units / get_unit_detail   (local)     │
//! │              ──► set_cache_mode / clear_unit / clear_all               │
//! │              ──► enqueue_write / retry_write / abandon_write           │
//! │              ──► sync_now / sync_in_background ──► SyncHandle          │
//! │              ──► resolve_asset / get_cache_metrics                     │
//! │                                                                         │
//! │  ┌──────────────┐   ┌────────────────┐   ┌───────────────────────┐     │
//! │  │  SyncEngine  │──►│ OutboxProcessor│   │     AssetResolver     │     │
//! │  │  run_cycle() │   │    drain()     │   │ resolve / prefetch    │     │
//! │  └──────┬───────┘   └────────────────┘   └───────────────────────┘     │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │             Database (units, lessons, assets, outbox)            │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  RULES:                                                                │
//! │  • at most one sync cycle runs; concurrent callers join it             │
//! │  • a caller that stops listening never aborts the cycle                │
//! │  • a learner write is durable before any network attempt              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scholar_core::{
    AssetRecord, CacheMode, DownloadStatus, LessonRecord, OutboxEntry, OutboxWrite, SyncOutcome,
    UnitFilter, UnitRecord,
};
use scholar_db::{Database, DbConfig, SchemaCheck};

use crate::assets::AssetResolver;
use crate::config::CacheConfig;
use crate::engine::{SyncEngine, SyncReport};
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEventEmitter, NoOpEmitter};
use crate::outbox::{DrainReport, OutboxProcessor, RetryPolicy};
use crate::remote::{AssetFetcher, RemoteApi};
use crate::tasks::{SharedTask, TaskRegistry};

// =============================================================================
// Public Types
// =============================================================================

/// A unit with everything stored under it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitDetail {
    pub unit: UnitRecord,
    pub lessons: Vec<LessonRecord>,
    pub assets: Vec<AssetRecord>,
}

/// What a read does when the store is still empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirstAccess {
    /// Answer from the store now; start a sync in the background.
    #[default]
    Background,
    /// Wait for the first sync, then answer from the store.
    AwaitSync,
}

/// Numbers for the cache-management screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    /// Bytes of downloaded media on disk.
    pub asset_bytes: u64,
    /// Bytes of stored unit/lesson payload JSON.
    pub payload_bytes: i64,
    /// Database file plus media.
    pub storage_bytes: u64,
    pub unit_count: i64,
    pub cached_assets: i64,
    /// Writes not yet delivered (pending or in flight).
    pub pending_writes: i64,
    pub failed_writes: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncOutcome>,
    pub last_sync_error: Option<String>,
}

/// A running sync cycle that a caller may wait on or walk away from.
pub struct SyncHandle {
    task: SharedTask<SyncReport>,
    joined: bool,
}

impl SyncHandle {
    /// Waits for the cycle to finish.
    pub async fn wait(self) -> CacheResult<SyncReport> {
        self.task.await
    }

    /// Waits unless `token` fires first. Cancelling only detaches this
    /// caller; the cycle keeps running.
    ///
    /// ## Returns
    /// `None` if the token fired first.
    pub async fn wait_or_cancel(self, token: &CancellationToken) -> Option<CacheResult<SyncReport>> {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Stopped waiting for sync cycle");
                None
            }
            result = self.task => Some(result),
        }
    }

    /// True if this handle joined a cycle another caller started.
    pub fn joined_existing(&self) -> bool {
        self.joined
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Collaborators for [`CacheService::new`].
pub struct CacheParts {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    fetcher: Arc<dyn AssetFetcher>,
    assets_dir: PathBuf,
    emitter: Arc<dyn CacheEventEmitter>,
    retry_policy: RetryPolicy,
    sync_on_first_access: bool,
    prefetch_after_sync: bool,
}

impl CacheParts {
    /// ## Arguments
    /// * `db` - An initialized store
    /// * `remote` - Sync API
    /// * `fetcher` - Media downloader
    /// * `assets_dir` - Where media files live
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        fetcher: Arc<dyn AssetFetcher>,
        assets_dir: impl Into<PathBuf>,
    ) -> Self {
        CacheParts {
            db,
            remote,
            fetcher,
            assets_dir: assets_dir.into(),
            emitter: Arc::new(NoOpEmitter),
            retry_policy: RetryPolicy::default(),
            sync_on_first_access: true,
            prefetch_after_sync: true,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn CacheEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn sync_on_first_access(mut self, enabled: bool) -> Self {
        self.sync_on_first_access = enabled;
        self
    }

    pub fn prefetch_after_sync(mut self, enabled: bool) -> Self {
        self.prefetch_after_sync = enabled;
        self
    }
}

struct Inner {
    db: Database,
    resolver: AssetResolver,
    outbox: OutboxProcessor,
    engine: SyncEngine,
    syncs: TaskRegistry<(), SyncReport>,
    first_access_done: AtomicBool,
    sync_on_first_access: bool,
    prefetch_after_sync: bool,
    last_reset: Option<SchemaCheck>,
}

/// Offline-first access to units, lessons, media and learner writes.
///
/// Clone is cheap; clones share all state.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<Inner>,
}

impl CacheService {
    /// Opens the store described by `config` and builds the service.
    ///
    /// Runs the startup schema check. If cached content had to be purged,
    /// [`last_reset`](Self::last_reset) reports it so the UI can say so.
    pub async fn open(
        config: &CacheConfig,
        remote: Arc<dyn RemoteApi>,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> CacheResult<Self> {
        config.validate()?;

        let db = Database::new(DbConfig::new(config.database_path())).await?;
        let check = db.initialize().await?;

        let parts = CacheParts::new(db, remote, fetcher, config.assets_dir())
            .with_retry_policy(RetryPolicy::from_config(config))
            .sync_on_first_access(config.sync.sync_on_first_access)
            .prefetch_after_sync(config.sync.prefetch_after_sync);

        let service = Self::build(parts, check.purged.then(|| check.clone()));

        if !check.orphaned_files.is_empty() {
            let removed = service.inner.resolver.remove_files(&check.orphaned_files).await;
            warn!(removed, "Cached content purged after schema change");
        }
        if let Err(e) = service.inner.resolver.remove_orphans().await {
            warn!(error = %e, "Could not sweep orphaned asset files");
        }

        info!(
            device_id = %config.device_id(),
            schema_version = check.current_version,
            "Cache service ready"
        );

        Ok(service)
    }

    /// Builds the service over an already initialized store.
    pub fn new(parts: CacheParts) -> Self {
        Self::build(parts, None)
    }

    fn build(parts: CacheParts, last_reset: Option<SchemaCheck>) -> Self {
        let CacheParts {
            db,
            remote,
            fetcher,
            assets_dir,
            emitter,
            retry_policy,
            sync_on_first_access,
            prefetch_after_sync,
        } = parts;

        let resolver =
            AssetResolver::with_emitter(db.clone(), fetcher, assets_dir, Arc::clone(&emitter));
        let outbox = OutboxProcessor::with_emitter(
            db.clone(),
            Arc::clone(&remote),
            retry_policy,
            Arc::clone(&emitter),
        );
        let engine = SyncEngine::with_emitter(
            db.clone(),
            remote,
            outbox.clone(),
            resolver.clone(),
            emitter,
        );

        CacheService {
            inner: Arc::new(Inner {
                db,
                resolver,
                outbox,
                engine,
                syncs: TaskRegistry::new("sync"),
                first_access_done: AtomicBool::new(false),
                sync_on_first_access,
                prefetch_after_sync,
                last_reset,
            }),
        }
    }

    /// Schema check of [`open`](Self::open) if it discarded content.
    pub fn last_reset(&self) -> Option<&SchemaCheck> {
        self.inner.last_reset.as_ref()
    }

    /// The underlying store.
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets a unit from the store.
    pub async fn get_unit(&self, unit_id: &str) -> CacheResult<Option<UnitRecord>> {
        self.get_unit_with(unit_id, FirstAccess::Background).await
    }

    pub async fn get_unit_with(
        &self,
        unit_id: &str,
        first_access: FirstAccess,
    ) -> CacheResult<Option<UnitRecord>> {
        self.on_read(first_access).await?;
        Ok(self.inner.db.units().get(unit_id).await?)
    }

    /// Lists stored units.
    pub async fn list_units(&self, filter: UnitFilter) -> CacheResult<Vec<UnitRecord>> {
        self.list_units_with(filter, FirstAccess::Background).await
    }

    pub async fn list_units_with(
        &self,
        filter: UnitFilter,
        first_access: FirstAccess,
    ) -> CacheResult<Vec<UnitRecord>> {
        self.on_read(first_access).await?;
        Ok(self.inner.db.units().list(filter).await?)
    }

    /// Gets a unit with its lessons and asset rows.
    pub async fn get_unit_detail(&self, unit_id: &str) -> CacheResult<Option<UnitDetail>> {
        self.get_unit_detail_with(unit_id, FirstAccess::Background).await
    }

    pub async fn get_unit_detail_with(
        &self,
        unit_id: &str,
        first_access: FirstAccess,
    ) -> CacheResult<Option<UnitDetail>> {
        self.on_read(first_access).await?;

        let db = &self.inner.db;
        let Some(unit) = db.units().get(unit_id).await? else {
            return Ok(None);
        };
        let lessons = db.lessons().list_for_unit(unit_id).await?;
        let assets = db.assets().list_for_unit(unit_id).await?;

        Ok(Some(UnitDetail {
            unit,
            lessons,
            assets,
        }))
    }

    /// Read-through: an empty store triggers (or waits for) the first sync.
    async fn on_read(&self, first_access: FirstAccess) -> CacheResult<()> {
        let first = !self.inner.first_access_done.swap(true, Ordering::SeqCst);

        match first_access {
            FirstAccess::Background => {
                if first && self.inner.sync_on_first_access && self.store_is_empty().await? {
                    debug!("Empty cache on first access; syncing in background");
                    drop(self.sync_in_background());
                }
            }
            FirstAccess::AwaitSync => {
                let running = self.inner.syncs.is_running(&());
                if (first || running) && self.store_is_empty().await? {
                    debug!("Empty cache; waiting for first sync");
                    match self.sync_in_background().wait().await {
                        Ok(report) if report.status == SyncOutcome::Failed => {
                            warn!("First sync failed; serving local data")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "First sync failed; serving local data"),
                    }
                }
            }
        }

        Ok(())
    }

    async fn store_is_empty(&self) -> CacheResult<bool> {
        Ok(self.inner.db.units().count().await? == 0)
    }

    // =========================================================================
    // Cache Mode & Clearing
    // =========================================================================

    /// Switches a unit between `minimal` and `full`.
    ///
    /// `full` starts a background download of all its media (and a sync if
    /// the stored payload is only minimal). `minimal` deletes the media.
    pub async fn set_cache_mode(&self, unit_id: &str, mode: CacheMode) -> CacheResult<()> {
        let units = self.inner.db.units();
        let unit = units
            .get(unit_id)
            .await?
            .ok_or_else(|| CacheError::validation(format!("Unknown unit: {}", unit_id)))?;

        units.set_cache_mode(unit_id, mode).await?;
        info!(unit_id = %unit_id, mode = %mode, "Cache mode changed");

        match mode {
            CacheMode::Full => {
                units
                    .set_download_status(unit_id, DownloadStatus::Downloading)
                    .await?;
                drop(self.inner.resolver.spawn_prefetch(unit_id));

                if unit.payload_mode == CacheMode::Minimal {
                    drop(self.sync_in_background());
                }
            }
            CacheMode::Minimal => {
                self.inner.resolver.evict_unit(unit_id).await?;
                units.set_download_status(unit_id, DownloadStatus::Idle).await?;
            }
        }

        Ok(())
    }

    /// Waits for the media download of a unit (starting one if none runs).
    pub async fn prefetch_unit(&self, unit_id: &str) -> CacheResult<DownloadStatus> {
        self.inner.resolver.spawn_prefetch(unit_id).await
    }

    /// Deletes a unit, its lessons, asset rows and files.
    ///
    /// ## Returns
    /// Number of files removed from disk.
    pub async fn clear_unit(&self, unit_id: &str) -> CacheResult<usize> {
        let files = self.inner.db.units().delete(unit_id).await?;
        let removed = self.inner.resolver.remove_files(&files).await;
        info!(unit_id = %unit_id, removed, "Unit cleared");
        Ok(removed)
    }

    /// Deletes all cached content and media. Queued writes are kept.
    ///
    /// ## Returns
    /// Number of files removed from disk.
    pub async fn clear_all(&self) -> CacheResult<usize> {
        let files = self.inner.db.clear_content().await?;
        let mut removed = self.inner.resolver.remove_files(&files).await;
        removed += self.inner.resolver.remove_orphans().await?;
        info!(removed, "Cache cleared");
        Ok(removed)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Runs a sync cycle (or joins the running one) and waits for it.
    pub async fn sync_now(&self) -> CacheResult<SyncReport> {
        self.sync_in_background().wait().await
    }

    /// Starts a sync cycle unless one is running, and returns a handle to it.
    pub fn sync_in_background(&self) -> SyncHandle {
        let service = self.clone();
        let (task, joined) = self
            .inner
            .syncs
            .run_or_join((), move || async move { service.sync_cycle().await });
        SyncHandle { task, joined }
    }

    /// True while a sync cycle runs.
    pub fn is_syncing(&self) -> bool {
        self.inner.syncs.is_running(&())
    }

    async fn sync_cycle(&self) -> CacheResult<SyncReport> {
        let report = self.inner.engine.run_cycle().await?;

        if self.inner.prefetch_after_sync && report.status != SyncOutcome::Failed {
            self.prefetch_full_units().await?;
        }

        Ok(report)
    }

    /// Starts downloads for full-mode units with media not on disk.
    async fn prefetch_full_units(&self) -> CacheResult<()> {
        let db = &self.inner.db;
        for unit in db.units().list(UnitFilter::mode(CacheMode::Full)).await? {
            let assets = db.assets().list_for_unit(&unit.id).await?;
            if assets.iter().any(|asset| !asset.is_cached()) {
                debug!(unit_id = %unit.id, "Prefetching new media after sync");
                drop(self.inner.resolver.spawn_prefetch(&unit.id));
            }
        }
        Ok(())
    }

    /// Periodic background sync until `shutdown` fires.
    pub async fn run_sync_loop(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> CacheResult<()> {
        if interval.is_zero() {
            return Err(CacheError::validation("Sync interval must be greater than 0"));
        }

        info!(interval_secs = interval.as_secs(), "Background sync worker starting");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sync_in_background().wait_or_cancel(&shutdown).await {
                        Some(Ok(report)) => {
                            debug!(status = %report.status, "Periodic sync finished")
                        }
                        Some(Err(e)) => error!(error = %e, "Periodic sync failed"),
                        None => break,
                    }
                }
            }
        }

        info!("Background sync worker stopped");
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Durably queues a learner write. Succeeds offline.
    pub async fn enqueue_write(&self, write: OutboxWrite) -> CacheResult<OutboxEntry> {
        self.inner.outbox.enqueue(&write).await
    }

    /// Delivers due writes now, without pulling.
    pub async fn drain_outbox(&self) -> CacheResult<DrainReport> {
        self.inner.outbox.drain().await
    }

    /// Writes the server refused for good.
    pub async fn failed_writes(&self) -> CacheResult<Vec<OutboxEntry>> {
        Ok(self.inner.db.outbox().failed().await?)
    }

    /// Puts a refused write back in the queue.
    pub async fn retry_write(&self, entry_id: &str) -> CacheResult<OutboxEntry> {
        let entry = self.inner.db.outbox().retry_failed(entry_id).await?;
        info!(entry_id = %entry.id, "Failed write re-queued");
        Ok(entry)
    }

    /// Drops a refused write.
    pub async fn abandon_write(&self, entry_id: &str) -> CacheResult<OutboxEntry> {
        let entry = self.inner.db.outbox().abandon(entry_id).await?;
        warn!(entry_id = %entry.id, key = %entry.idempotency_key, "Failed write abandoned");
        Ok(entry)
    }

    // =========================================================================
    // Assets & Metrics
    // =========================================================================

    /// Local file of an asset, downloading it if needed.
    pub async fn resolve_asset(&self, asset_id: &str) -> CacheResult<PathBuf> {
        self.inner.resolver.resolve(asset_id).await
    }

    pub async fn get_cache_metrics(&self) -> CacheResult<CacheMetrics> {
        let db = &self.inner.db;

        let asset_bytes = self.inner.resolver.disk_usage().await?;
        let db_bytes = u64::try_from(db.database_size().await?).unwrap_or(0);
        let counts = db.outbox().count_by_status().await?;
        let metadata = db.metadata().get().await?;

        Ok(CacheMetrics {
            asset_bytes,
            payload_bytes: db.units().payload_bytes().await?,
            storage_bytes: db_bytes + asset_bytes,
            unit_count: db.units().count().await?,
            cached_assets: db.assets().count_cached().await?,
            pending_writes: counts.pending + counts.in_flight,
            failed_writes: counts.failed_permanent,
            last_sync_at: metadata.as_ref().and_then(|m| m.last_sync_at),
            last_sync_status: metadata.as_ref().and_then(|m| m.last_sync_status),
            last_sync_error: metadata.and_then(|m| m.last_sync_error),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
