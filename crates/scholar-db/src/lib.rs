//! # scholar-db: Local Store for the Learner Offline Cache
//!
//! This crate owns the on-device SQLite store that mirrors units, lessons and
//! media assets, plus the outbox of learner writes awaiting delivery.
//! It uses sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Scholar Cache Data Flow                            │
//! │                                                                         │
//! │  CacheService / SyncEngine (scholar-sync)                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    scholar-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  + schema    │  │   │
//! │  │   │               │    │ UnitRepo      │    │  version     │  │   │
//! │  │   │ SqlitePool    │◄───│ LessonRepo    │    │  check       │  │   │
//! │  │   │ apply_delta   │    │ AssetRepo     │    │              │  │   │
//! │  │   │ clear_content │    │ OutboxRepo    │    │ 001_init.sql │  │   │
//! │  │   │               │    │ MetadataRepo  │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <app data dir>/scholar-cache.db                              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, startup checks and store-wide transactions
//! - [`migrations`] - Embedded migrations and the schema-version check
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations (unit, lesson, asset, ...)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scholar_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/scholar-cache.db")).await?;
//! let check = db.initialize().await?;
//! if check.purged {
//!     // show "content was reset after an update"
//! }
//!
//! let units = db.units().list(UnitFilter::all()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use migrations::SchemaCheck;
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::asset::AssetRepository;
pub use repository::delta::ApplySummary;
pub use repository::lesson::LessonRepository;
pub use repository::metadata::MetadataRepository;
pub use repository::outbox::{OutboxCounts, OutboxRepository};
pub use repository::unit::UnitRepository;
