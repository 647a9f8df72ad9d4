//! # Database Pool Management
//!
//! Connection pool creation, startup checks and store-wide transactions.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Connection Pool                           │
//! │                                                                         │
//! │  App Startup                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbConfig::new(path) ← Configure pool + schema versions                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← Create pool + run migrations            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::initialize().await ← Schema check, crash recovery           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────┐                           │
//! │  │            SqlitePool                    │                           │
//! │  │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐       │                           │
//! │  │  │Conn1│ │Conn2│ │Conn3│ │Conn4│ ...   │  (max_connections)        │
//! │  │  └─────┘ └─────┘ └─────┘ └─────┘       │                           │
//! │  └─────────────────────────────────────────┘                           │
//! │       │                                                                 │
//! │       │ UI reads, sync cycle and downloads share the pool              │
//! │       ▼                                                                 │
//! │  get_unit()      ──► uses Conn1                                        │
//! │  apply_delta()   ──► uses Conn2 (one transaction)                      │
//! │  mark_cached()   ──► uses Conn3                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled so UI reads are never
//! blocked by a sync cycle committing a large delta.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use scholar_core::{PulledDelta, MIN_SUPPORTED_SCHEMA_VERSION, SCHEMA_VERSION};

use crate::error::{DbError, DbResult};
use crate::migrations::{self, SchemaCheck};
use crate::repository::asset::AssetRepository;
use crate::repository::delta::{self, ApplySummary};
use crate::repository::lesson::LessonRepository;
use crate::repository::metadata::MetadataRepository;
use crate::repository::outbox::OutboxRepository;
use crate::repository::unit::UnitRepository;

const IN_MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/scholar-cache.db")
///     .max_connections(4)
///     .min_connections(1);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 4 (UI reads, one sync cycle, a few downloads)
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection timeout duration.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection.
    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,

    /// Schema version this build writes.
    pub schema_version: i64,

    /// Oldest stored schema version readable in place.
    pub min_supported_schema_version: i64,
}

impl DbConfig {
    /// Creates a new database configuration with the given path.
    ///
    /// ## Arguments
    /// * `path` - Path to the SQLite database file. Will be created if it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 4,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
            schema_version: SCHEMA_VERSION,
            min_supported_schema_version: MIN_SUPPORTED_SCHEMA_VERSION,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Pins the schema version this store expects. Anything else on disk is
    /// purged at [`Database::initialize`].
    pub fn schema_version(mut self, version: i64) -> Self {
        self.schema_version = version;
        self.min_supported_schema_version = version;
        self
    }

    /// Sets the oldest stored version readable in place.
    pub fn min_supported_schema_version(mut self, version: i64) -> Self {
        self.min_supported_schema_version = version;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// ## Usage
    /// ```rust,ignore
    /// let db = Database::new(DbConfig::in_memory()).await?;
    /// // Database is isolated, perfect for tests
    /// ```
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            run_migrations: true,
            schema_version: SCHEMA_VERSION,
            min_supported_schema_version: MIN_SUPPORTED_SCHEMA_VERSION,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle providing repository access.
///
/// Cheap to clone; every clone shares the same pool.
#[derive(Debug, Clone)]
pub struct Database {
    /// The SQLite connection pool.
    pool: SqlitePool,
    schema_version: i64,
    min_supported_schema_version: i64,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Creates the database file (and its directory) if it doesn't exist
    /// 2. Configures SQLite:
    ///    - WAL mode for concurrent reads
    ///    - NORMAL synchronous (balance of safety/speed)
    ///    - Foreign keys enabled (unit → lessons/assets cascade)
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    ///
    /// ## Arguments
    /// * `config` - Database configuration
    ///
    /// ## Returns
    /// * `Ok(Database)` - Ready-to-use database handle
    /// * `Err(DbError)` - Connection or migration failed
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        let in_memory = config.is_in_memory();

        let base_options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
                }
            }

            SqliteConnectOptions::new()
                .filename(&config.database_path)
                // Create file if it doesn't exist
                .create_if_missing(true)
                // WAL mode: readers don't block writers, writers don't block readers
                .journal_mode(SqliteJournalMode::Wal)
        };

        let connect_options = base_options
            // NORMAL synchronous: data is safe from corruption, may lose the
            // last transaction on power loss
            .synchronous(SqliteSynchronous::Normal)
            // SQLite has them disabled by default for backwards compatibility
            .foreign_keys(true);

        debug!(in_memory, "Connection options configured");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout);

        // An in-memory database lives only as long as its connection.
        pool_options = if in_memory {
            pool_options.idle_timeout(None).max_lifetime(None)
        } else {
            pool_options.idle_timeout(Some(config.idle_timeout))
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let db = Database {
            pool,
            schema_version: config.schema_version,
            min_supported_schema_version: config.min_supported_schema_version,
        };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Runs database migrations.
    ///
    /// ## When To Call
    /// - Automatically called by `new()` if `run_migrations` is true
    /// - Manually call when migrations are disabled in config
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }

    /// Startup checks. Call once after [`Database::new`].
    ///
    /// ## What This Does
    /// 1. Schema-version check, purging content if unsupported (one transaction)
    /// 2. Outbox entries left `in_flight` by a crash go back to `pending`
    /// 3. Assets left `downloading` by a crash go back to `missing`
    ///
    /// ## Returns
    /// The [`SchemaCheck`]; its `orphaned_files` must be deleted by the caller.
    pub async fn initialize(&self) -> DbResult<SchemaCheck> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let check = migrations::check_schema_version(
            &mut tx,
            self.schema_version,
            self.min_supported_schema_version,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let recovered = self.outbox().recover_in_flight().await?;
        if recovered > 0 {
            warn!(recovered, "Re-queued outbox entries interrupted mid-delivery");
        }

        let interrupted = self.assets().reset_interrupted_downloads().await?;
        if interrupted > 0 {
            warn!(interrupted, "Reset assets left downloading by a previous run");
        }

        info!(
            previous = ?check.previous_version,
            current = check.current_version,
            purged = check.purged,
            "Cache store initialized"
        );

        Ok(check)
    }

    /// Schema version this handle writes.
    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    /// Returns a reference to the connection pool.
    ///
    /// Prefer repository methods when available.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the unit repository.
    pub fn units(&self) -> UnitRepository {
        UnitRepository::new(self.pool.clone())
    }

    /// Returns the lesson repository.
    pub fn lessons(&self) -> LessonRepository {
        LessonRepository::new(self.pool.clone())
    }

    /// Returns the asset repository.
    pub fn assets(&self) -> AssetRepository {
        AssetRepository::new(self.pool.clone())
    }

    /// Returns the outbox repository.
    pub fn outbox(&self) -> OutboxRepository {
        OutboxRepository::new(self.pool.clone())
    }

    /// Returns the cache metadata repository.
    pub fn metadata(&self) -> MetadataRepository {
        MetadataRepository::new(self.pool.clone())
    }

    /// Applies a pulled delta atomically, cursor included.
    ///
    /// ## Returns
    /// An [`ApplySummary`] whose `stale_files` the caller deletes after this
    /// returns.
    pub async fn apply_delta(&self, delta: &PulledDelta) -> DbResult<ApplySummary> {
        delta::apply_delta(&self.pool, delta, self.schema_version).await
    }

    /// Deletes every unit, lesson and asset and resets the sync cursor.
    /// The outbox is untouched.
    ///
    /// ## Returns
    /// Local files of the deleted assets.
    pub async fn clear_content(&self) -> DbResult<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let files = migrations::purge_content(&mut tx).await?;

        sqlx::query("UPDATE cache_metadata SET last_sync_cursor = NULL WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        info!(files = files.len(), "Cleared all cached content");
        Ok(files)
    }

    /// Size of the database file in bytes (page_count × page_size).
    pub async fn database_size(&self) -> DbResult<i64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok(page_count * page_size)
    }

    /// Closes the database connection pool.
    ///
    /// ## Note
    /// After calling close, all repository operations will fail.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database is healthy (can execute queries).
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use scholar_core::{
        AssetRecord, AssetStatus, OutboxWrite, SyncOutcome, UnitPayload, UnitRecord,
        MetadataUpdate,
    };
    use serde_json::json;

    async fn seeded(db: &Database) {
        db.units()
            .upsert(&UnitRecord::new("u1", UnitPayload::titled("Fractions"), SCHEMA_VERSION))
            .await
            .unwrap();
        db.assets()
            .upsert(&AssetRecord {
                id: "a1".into(),
                unit_id: "u1".into(),
                owner_id: "u1".into(),
                remote_url: "https://cdn.example.com/a1.png".into(),
                local_uri: Some("/cache/a1".into()),
                status: AssetStatus::Cached,
                checksum: None,
                size: Some(10),
            })
            .await
            .unwrap();
        db.metadata()
            .update(
                &MetadataUpdate::default()
                    .cursor(Some("c-9".into()))
                    .status(SyncOutcome::Success, chrono::Utc::now()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);
        assert!(db.database_size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = DbConfig::new("/tmp/scholar-test.db")
            .max_connections(10)
            .min_connections(2)
            .schema_version(7);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.schema_version, 7);
        assert_eq!(config.min_supported_schema_version, 7);
        assert!(!config.is_in_memory());
        assert!(DbConfig::in_memory().is_in_memory());
    }

    #[tokio::test]
    async fn test_initialize_fresh_install() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let check = db.initialize().await.unwrap();

        assert!(check.is_fresh_install());
        assert!(!check.purged);
        assert_eq!(check.current_version, SCHEMA_VERSION);

        // Second run is a no-op.
        let again = db.initialize().await.unwrap();
        assert_eq!(again.previous_version, Some(SCHEMA_VERSION));
        assert!(!again.purged);
    }

    #[tokio::test]
    async fn test_initialize_purges_unsupported_version_but_keeps_outbox() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        seeded(&db).await;
        db.outbox()
            .enqueue(&OutboxWrite::new("progress", "p1", json!({"pct": 40})))
            .await
            .unwrap();

        // Pretend an older build wrote this store.
        sqlx::query("UPDATE cache_metadata SET schema_version = 1 WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();

        let check = db.initialize().await.unwrap();
        assert!(check.purged);
        assert_eq!(check.previous_version, Some(1));
        assert_eq!(check.orphaned_files, vec!["/cache/a1".to_string()]);

        assert!(db.units().get("u1").await.unwrap().is_none());
        assert!(db.assets().get("a1").await.unwrap().is_none());

        let meta = db.metadata().get().await.unwrap().unwrap();
        assert_eq!(meta.schema_version, SCHEMA_VERSION);
        assert!(meta.last_sync_cursor.is_none());
        assert!(meta.last_sync_status.is_none());

        assert_eq!(db.outbox().pending_in_order().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_purges_newer_version() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        seeded(&db).await;

        sqlx::query("UPDATE cache_metadata SET schema_version = ?1 WHERE id = 1")
            .bind(SCHEMA_VERSION + 1)
            .execute(db.pool())
            .await
            .unwrap();

        let check = db.initialize().await.unwrap();
        assert!(check.purged);
        assert_eq!(db.units().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_initialize_upgrades_readable_version_in_place() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        seeded(&db).await;

        sqlx::query("UPDATE cache_metadata SET schema_version = 2 WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();

        // Same pool, reopened with a build that still reads v2.
        let db = Database {
            pool: db.pool().clone(),
            schema_version: 4,
            min_supported_schema_version: 2,
        };
        let check = db.initialize().await.unwrap();

        assert!(!check.purged);
        assert_eq!(check.previous_version, Some(2));
        assert_eq!(check.current_version, 4);
        assert!(db.units().get("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_content_keeps_outbox() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        seeded(&db).await;
        db.outbox()
            .enqueue(&OutboxWrite::new("progress", "p1", json!({})))
            .await
            .unwrap();

        let files = db.clear_content().await.unwrap();
        assert_eq!(files, vec!["/cache/a1".to_string()]);
        assert_eq!(db.units().count().await.unwrap(), 0);
        assert_eq!(db.outbox().pending_in_order().await.unwrap().len(), 1);

        let meta = db.metadata().get().await.unwrap().unwrap();
        assert!(meta.last_sync_cursor.is_none());
    }
}
