//! # Sync Engine
//!
//! One sync cycle: push local writes, pull remote changes, apply, stamp.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          run_cycle()                                    │
//! │                                                                         │
//! │  1. PUSH      OutboxProcessor::drain()                                 │
//! │               the pull below then reflects this device's own writes    │
//! │                                                                         │
//! │  2. PULL      GET /sync/pull?cursor=..&mode=minimal&full=..&refresh=.. │
//! │               full    = units the learner keeps in full mode           │
//! │               refresh = full-mode units stored with a minimal payload  │
//! │                                                                         │
//! │  3. APPLY     Database::apply_delta  (units, lessons, assets,          │
//! │               deletions and cursor in ONE transaction)                 │
//! │               then delete files of removed / changed assets            │
//! │                                                                         │
//! │  4. FINALIZE  last_sync_status, last_sync_at, last_sync_error          │
//! │                                                                         │
//! │  STATUS:                                                               │
//! │  • failed   pull or apply failed (cursor unchanged)                    │
//! │  • partial  pulled, but writes were deferred/rejected or rows skipped  │
//! │  • success  everything went through                                    │
//! │                                                                         │
//! │  A failed pull is a soft failure: run_cycle still returns Ok(report).  │
//! │  Only local storage errors in the finalize step surface as Err.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use scholar_core::{CacheMode, MetadataUpdate, SyncOutcome, UnitFilter};
use scholar_db::{ApplySummary, Database};

use crate::assets::AssetResolver;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEventEmitter, NoOpEmitter};
use crate::outbox::{DrainReport, OutboxProcessor};
use crate::remote::{PullRequest, RemoteApi};

// =============================================================================
// Sync Report
// =============================================================================

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub units_pulled: usize,
    pub lessons_pulled: usize,
    pub assets_updated: usize,
    pub deleted: usize,
    pub status: SyncOutcome,
    /// Cursor stored after this cycle.
    pub cursor: Option<String>,
    pub errors: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn started() -> Self {
        SyncReport {
            pushed: 0,
            rejected: 0,
            deferred: 0,
            units_pulled: 0,
            lessons_pulled: 0,
            assets_updated: 0,
            deleted: 0,
            status: SyncOutcome::Failed,
            cursor: None,
            errors: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    fn record_drain(&mut self, drain: &DrainReport) {
        self.pushed = drain.delivered;
        self.rejected = drain.rejected;
        self.deferred = drain.deferred;
        self.errors.extend(drain.errors.iter().cloned());
    }

    fn record_apply(&mut self, summary: &ApplySummary) {
        self.units_pulled = summary.units_upserted;
        self.lessons_pulled = summary.lessons_upserted;
        self.assets_updated = summary.assets_updated;
        self.deleted = summary.deleted;
        for id in &summary.skipped_orphans {
            self.errors.push(format!("Skipped lesson {} without a stored unit", id));
        }
        for id in &summary.skipped_invalid {
            self.errors.push(format!("Skipped invalid row {}", id));
        }
    }

    /// First error of the cycle, for `last_sync_error`.
    fn summary_error(&self) -> Option<String> {
        match self.status {
            SyncOutcome::Success => None,
            _ => self.errors.first().cloned(),
        }
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Runs sync cycles. Does not de-duplicate concurrent cycles; the cache
/// service guarantees at most one runs at a time.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    outbox: OutboxProcessor,
    resolver: AssetResolver,
    emitter: Arc<dyn CacheEventEmitter>,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        outbox: OutboxProcessor,
        resolver: AssetResolver,
    ) -> Self {
        Self::with_emitter(db, remote, outbox, resolver, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        outbox: OutboxProcessor,
        resolver: AssetResolver,
        emitter: Arc<dyn CacheEventEmitter>,
    ) -> Self {
        SyncEngine {
            db,
            remote,
            outbox,
            resolver,
            emitter,
        }
    }

    /// Runs one full cycle.
    ///
    /// ## Returns
    /// The cycle report. Network failures are reported through
    /// `status = failed`, not as `Err`.
    pub async fn run_cycle(&self) -> CacheResult<SyncReport> {
        info!("Sync cycle starting");
        let mut report = SyncReport::started();

        // 1. Push
        let mut drain_failed = false;
        match self.outbox.drain().await {
            Ok(drain) => report.record_drain(&drain),
            Err(e) => {
                warn!(error = %e, "Outbox drain failed");
                report.errors.push(e.to_string());
                drain_failed = true;
            }
        }

        // 2. Pull + 3. Apply
        let applied = match self.pull_and_apply(&mut report).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Pull failed; keeping local data");
                report.errors.push(e.to_string());
                None
            }
        };

        report.status = match applied {
            None => SyncOutcome::Failed,
            Some(summary)
                if drain_failed
                    || report.deferred > 0
                    || report.rejected > 0
                    || summary.has_skips() =>
            {
                SyncOutcome::Partial
            }
            Some(_) => SyncOutcome::Success,
        };

        // 4. Finalize
        report.cursor = self.db.metadata().cursor().await?;
        report.finished_at = Utc::now();

        self.db
            .metadata()
            .update(
                &MetadataUpdate::default()
                    .status(report.status, report.finished_at)
                    .error(report.summary_error()),
            )
            .await?;

        info!(
            status = %report.status,
            pushed = report.pushed,
            deferred = report.deferred,
            rejected = report.rejected,
            units = report.units_pulled,
            lessons = report.lessons_pulled,
            deleted = report.deleted,
            "Sync cycle finished"
        );

        self.emitter.sync_finished(&report);
        Ok(report)
    }

    async fn pull_and_apply(&self, report: &mut SyncReport) -> CacheResult<ApplySummary> {
        let request = self.pull_request().await?;
        debug!(
            cursor = ?request.cursor,
            full = request.full.len(),
            refresh = request.refresh.len(),
            "Pulling remote changes"
        );

        let delta = self.remote.pull(&request).await.map_err(CacheError::from)?;
        let summary = self.db.apply_delta(&delta).await?;
        report.record_apply(&summary);

        if !summary.stale_files.is_empty() {
            let removed = self.resolver.remove_files(&summary.stale_files).await;
            debug!(removed, "Deleted files of changed assets");
        }

        Ok(summary)
    }

    async fn pull_request(&self) -> CacheResult<PullRequest> {
        let cursor = self.db.metadata().cursor().await?;
        let full_units = self.db.units().list(UnitFilter::mode(CacheMode::Full)).await?;

        let refresh = full_units
            .iter()
            .filter(|unit| unit.needs_full_refresh())
            .map(|unit| unit.id.clone())
            .collect();

        Ok(PullRequest {
            cursor,
            default_mode: CacheMode::Minimal,
            full: full_units.into_iter().map(|unit| unit.id).collect(),
            refresh,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
