//! # Database Migrations
//!
//! Embedded SQL migrations and the schema-version check run at startup.
//!
//! ## How Startup Works
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Startup Process                                    │
//! │                                                                         │
//! │  App Startup                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  MIGRATOR.run() ← create tables that don't exist yet                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Read cache_metadata.schema_version                                    │
//! │       │                                                                 │
//! │       ├── no row              → insert (fresh install)                 │
//! │       ├── == expected         → nothing to do                          │
//! │       ├── min ≤ stored < exp  → stamp new version, keep content        │
//! │       └── < min or > expected → PURGE units, lessons, assets           │
//! │                                 reset cursor (outbox is kept)          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SchemaCheck returned to the caller                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. Name format: `NNN_description.sql` (e.g., `002_add_asset_mime.sql`)
//! 3. Write idempotent SQL (use `IF NOT EXISTS` where possible)
//! 4. **NEVER** modify existing migrations - always add new ones
//! 5. Bump `scholar_core::SCHEMA_VERSION` if stored rows change shape

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::error::DbResult;

/// Embedded migrations from the `migrations/sqlite` directory.
///
/// ## Directory Structure
/// ```text
/// migrations/sqlite/
/// └── 001_initial_schema.sql  # units, lessons, assets, outbox, metadata
/// ```
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations.
///
/// ## Safety
/// - Idempotent: safe to run multiple times
/// - Transactional: each migration runs in a transaction
/// - Ordered: migrations run in filename order (001, 002, ...)
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

// =============================================================================
// Schema Version Check
// =============================================================================

/// Result of the startup schema-version check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaCheck {
    /// Version found on disk; `None` on a fresh install.
    pub previous_version: Option<i64>,
    /// Version stamped after the check.
    pub current_version: i64,
    /// True when cached content was discarded.
    pub purged: bool,
    /// Local files of purged assets. The caller deletes them.
    pub orphaned_files: Vec<String>,
}

impl SchemaCheck {
    /// True on the very first launch.
    pub fn is_fresh_install(&self) -> bool {
        self.previous_version.is_none()
    }
}

/// Compares the stored schema version with the one this build writes.
///
/// Runs inside the caller's transaction so a purge and the new stamp land
/// together.
///
/// ## Arguments
/// * `conn` - Connection (normally a transaction)
/// * `expected` - Version this build writes
/// * `min_supported` - Oldest version this build reads in place
pub async fn check_schema_version(
    conn: &mut SqliteConnection,
    expected: i64,
    min_supported: i64,
) -> DbResult<SchemaCheck> {
    let stored: Option<i64> =
        sqlx::query_scalar("SELECT schema_version FROM cache_metadata WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;

    let Some(stored) = stored else {
        info!(version = expected, "Fresh cache store, stamping schema version");
        sqlx::query("INSERT INTO cache_metadata (id, schema_version) VALUES (1, ?1)")
            .bind(expected)
            .execute(&mut *conn)
            .await?;

        return Ok(SchemaCheck {
            previous_version: None,
            current_version: expected,
            purged: false,
            orphaned_files: Vec::new(),
        });
    };

    if stored == expected {
        return Ok(SchemaCheck {
            previous_version: Some(stored),
            current_version: expected,
            purged: false,
            orphaned_files: Vec::new(),
        });
    }

    if stored >= min_supported && stored < expected {
        info!(
            from = stored,
            to = expected,
            "Stored schema is readable, upgrading version stamp in place"
        );
        sqlx::query("UPDATE cache_metadata SET schema_version = ?1 WHERE id = 1")
            .bind(expected)
            .execute(&mut *conn)
            .await?;

        return Ok(SchemaCheck {
            previous_version: Some(stored),
            current_version: expected,
            purged: false,
            orphaned_files: Vec::new(),
        });
    }

    warn!(
        stored,
        expected, min_supported, "Stored schema unsupported, purging cached content"
    );

    let orphaned_files = purge_content(conn).await?;

    sqlx::query(
        r#"
        UPDATE cache_metadata SET
            schema_version = ?1,
            last_sync_cursor = NULL,
            last_sync_status = NULL,
            last_sync_at = NULL,
            last_sync_error = NULL
        WHERE id = 1
        "#,
    )
    .bind(expected)
    .execute(&mut *conn)
    .await?;

    Ok(SchemaCheck {
        previous_version: Some(stored),
        current_version: expected,
        purged: true,
        orphaned_files,
    })
}

/// Deletes every unit, lesson and asset row. Returns the local files the
/// deleted assets pointed at.
pub(crate) async fn purge_content(conn: &mut SqliteConnection) -> DbResult<Vec<String>> {
    let files: Vec<String> =
        sqlx::query_scalar("SELECT local_uri FROM assets WHERE local_uri IS NOT NULL")
            .fetch_all(&mut *conn)
            .await?;

    // Children first.
    sqlx::query("DELETE FROM assets").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM lessons").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM units").execute(&mut *conn).await?;

    Ok(files)
}
