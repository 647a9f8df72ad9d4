//! # scholar-sync: Offline Cache and Sync for the Learner App
//!
//! Everything above the local store: the cache facade UI screens call, the
//! outbox that delivers learner writes, the pull/apply sync cycle and the
//! media resolver.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Learner Cache Architecture                       │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  CacheService (service.rs)                       │  │
//! │  │                                                                  │  │
//! │  │  Local reads, cache modes, writes, metrics                       │  │
//! │  │  Shares one in-flight sync between all callers                   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   SyncEngine   │  │OutboxProcessor │  │    AssetResolver       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ push → pull →  │  │ FIFO delivery, │  │ on-demand downloads,   │    │
//! │  │ apply → stamp  │  │ backoff, per-  │  │ checksum, prefetch,    │    │
//! │  │                │  │ target order   │  │ eviction               │    │
//! │  └───────┬────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │          │                   │                       │                  │
//! │          ▼                   ▼                       ▼                  │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  RemoteApi / AssetFetcher (remote.rs) ── HttpRemote (reqwest)    │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  EVENTS (to the UI via CacheEventEmitter):                             │
//! │  • sync_finished   - every cycle, with its SyncReport                  │
//! │  • asset_resolved  - every download, path or error                     │
//! │  • write_rejected  - a write parked as failed_permanent                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`service`] - `CacheService` facade
//! - [`engine`] - One sync cycle
//! - [`outbox`] - Write delivery and retry policy
//! - [`assets`] - Media resolution and prefetch
//! - [`remote`] - HTTP contract and client
//! - [`tasks`] - Keyed de-duplication of background work
//! - [`config`] - TOML + environment configuration
//! - [`error`] - `CacheError` and friends
//! - [`events`] - UI notifications
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scholar_sync::{CacheConfig, CacheService, HttpRemote};
//!
//! let config = CacheConfig::load_or_default(None);
//! let remote = Arc::new(HttpRemote::from_config(&config)?);
//! let cache = CacheService::open(&config, remote.clone(), remote).await?;
//!
//! let units = cache.list_units(UnitFilter::all()).await?;
//! let report = cache.sync_now().await?;
//! println!("Sync: {}", report.status);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod assets;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod outbox;
pub mod remote;
pub mod service;
pub mod tasks;

// =============================================================================
// Re-exports
// =============================================================================

pub use assets::AssetResolver;
pub use config::CacheConfig;
pub use engine::{SyncEngine, SyncReport};
pub use error::{CacheError, CacheErrorKind, CacheResult, ConfigError, RemoteError};
pub use events::{CacheEventEmitter, NoOpEmitter};
pub use outbox::{DrainReport, OutboxProcessor, RetryPolicy};
pub use remote::{
    AssetFetcher, HttpRemote, PullRequest, PushEntry, PushResult, PushStatus, RemoteApi,
};
pub use service::{CacheMetrics, CacheParts, CacheService, FirstAccess, SyncHandle, UnitDetail};
