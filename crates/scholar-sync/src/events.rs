//! # Cache Events
//!
//! Notifications for the UI layer. The cache never depends on the UI; the
//! app passes an emitter in and forwards events to whatever it renders with.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sync_finished   after every cycle, success or not                     │
//! │  asset_resolved  after every actual download attempt                   │
//! │  write_rejected  when the server refuses a queued write for good       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;

use scholar_core::OutboxEntry;

use crate::engine::SyncReport;
use crate::error::CacheError;

/// Receives cache events. Implementations must not block.
pub trait CacheEventEmitter: Send + Sync {
    /// A sync cycle ended.
    fn sync_finished(&self, report: &SyncReport);

    /// A download finished, with the local path or the failure.
    fn asset_resolved(&self, asset_id: &str, outcome: Result<&Path, &CacheError>);

    /// A queued write was parked as `failed_permanent`.
    fn write_rejected(&self, entry: &OutboxEntry, reason: &str);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl CacheEventEmitter for NoOpEmitter {
    fn sync_finished(&self, _report: &SyncReport) {}
    fn asset_resolved(&self, _asset_id: &str, _outcome: Result<&Path, &CacheError>) {}
    fn write_rejected(&self, _entry: &OutboxEntry, _reason: &str) {}
}
