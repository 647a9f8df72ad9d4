//! # scholarctl
//!
//! Inspects and drives the learner cache from a terminal.
//!
//! ## Usage
//! ```bash
//! # Storage, queue and last-sync summary
//! cargo run -p scholar-sync --bin scholarctl -- status
//!
//! # One sync cycle (push, pull, apply)
//! cargo run -p scholar-sync --bin scholarctl -- sync
//!
//! # Deliver queued writes only
//! cargo run -p scholar-sync --bin scholarctl -- drain
//!
//! # Keep a unit's media on the device
//! cargo run -p scholar-sync --bin scholarctl -- mode MATH-004 full
//!
//! # Writes the server refused, and what to do with them
//! cargo run -p scholar-sync --bin scholarctl -- failed
//! cargo run -p scholar-sync --bin scholarctl -- retry <entry-id>
//! cargo run -p scholar-sync --bin scholarctl -- abandon <entry-id>
//!
//! # Drop one unit, or everything
//! cargo run -p scholar-sync --bin scholarctl -- clear MATH-004
//! cargo run -p scholar-sync --bin scholarctl -- clear
//! ```
//!
//! Configuration comes from `--config <PATH>` or the default `cache.toml`,
//! then `SCHOLAR_*` environment variables. Logging follows `RUST_LOG`.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use scholar_core::{CacheMode, UnitFilter};
use scholar_sync::{CacheConfig, CacheService, HttpRemote};

const DEFAULT_LOG_FILTER: &str = "info,scholar=debug,sqlx=warn";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_help() {
    println!("Scholar Cache Control");
    println!();
    println!("Usage: scholarctl [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  status                 Storage, queue and last sync");
    println!("  sync                   Run one sync cycle");
    println!("  drain                  Deliver queued writes");
    println!("  mode <UNIT> <MODE>     Set cache mode (minimal | full)");
    println!("  failed                 List writes the server refused");
    println!("  retry <ENTRY>          Re-queue a refused write");
    println!("  abandon <ENTRY>        Drop a refused write");
    println!("  clear [UNIT]           Clear one unit, or all content");
    println!();
    println!("Options:");
    println!("  -c, --config <PATH>    Config file (default: platform config dir)");
    println!("  -h, --help             Show this help message");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let Some(command) = positional.first().cloned() else {
        print_help();
        return Ok(());
    };

    init_tracing();

    let config = CacheConfig::load(config_path)?;
    let remote = Arc::new(HttpRemote::from_config(&config)?);
    let cache = CacheService::open(&config, remote.clone(), remote).await?;

    if let Some(reset) = cache.last_reset() {
        println!(
            "⚠ Cached content was reset (schema {:?} → {})",
            reset.previous_version, reset.current_version
        );
    }

    match command.as_str() {
        "status" => {
            let metrics = cache.get_cache_metrics().await?;
            println!("Units:          {}", metrics.unit_count);
            println!("Cached assets:  {}", metrics.cached_assets);
            println!("Media bytes:    {}", metrics.asset_bytes);
            println!("Payload bytes:  {}", metrics.payload_bytes);
            println!("Storage bytes:  {}", metrics.storage_bytes);
            println!("Pending writes: {}", metrics.pending_writes);
            println!("Failed writes:  {}", metrics.failed_writes);
            match (metrics.last_sync_at, metrics.last_sync_status) {
                (Some(at), Some(status)) => println!("Last sync:      {} at {}", status, at),
                _ => println!("Last sync:      never"),
            }
            if let Some(error) = metrics.last_sync_error {
                println!("Last error:     {}", error);
            }
            for unit in cache.list_units(UnitFilter::mode(CacheMode::Full)).await? {
                println!("  full: {} ({})", unit.id, unit.download_status);
            }
        }
        "sync" => {
            let report = cache.sync_now().await?;
            println!(
                "Sync {}: pushed {}, deferred {}, rejected {}, units {}, lessons {}, deleted {}",
                report.status,
                report.pushed,
                report.deferred,
                report.rejected,
                report.units_pulled,
                report.lessons_pulled,
                report.deleted
            );
            for error in &report.errors {
                println!("  ✗ {}", error);
            }
        }
        "drain" => {
            let report = cache.drain_outbox().await?;
            println!(
                "Delivered {}, deferred {}, rejected {}, not due {}, blocked {}{}",
                report.delivered,
                report.deferred,
                report.rejected,
                report.skipped_not_due,
                report.blocked,
                if report.offline {
                    " (offline)"
                } else if report.refused {
                    " (refused: check the session token)"
                } else {
                    ""
                }
            );
        }
        "mode" => {
            let (Some(unit_id), Some(mode)) = (positional.get(1), positional.get(2)) else {
                println!("Usage: scholarctl mode <UNIT> <minimal|full>");
                return Ok(());
            };
            let mode: CacheMode = mode.parse()?;
            cache.set_cache_mode(unit_id, mode).await?;
            if mode == CacheMode::Full {
                let status = cache.prefetch_unit(unit_id).await?;
                println!("✓ {} is {} ({})", unit_id, mode, status);
            } else {
                println!("✓ {} is {}", unit_id, mode);
            }
        }
        "failed" => {
            let failed = cache.failed_writes().await?;
            if failed.is_empty() {
                println!("No refused writes");
            }
            for entry in failed {
                println!(
                    "{}  {}  {}  {}",
                    entry.id,
                    entry.intent,
                    entry.idempotency_key,
                    entry.last_error.unwrap_or_default()
                );
            }
        }
        "retry" | "abandon" => {
            let Some(entry_id) = positional.get(1) else {
                println!("Usage: scholarctl {} <ENTRY>", command);
                return Ok(());
            };
            if command == "retry" {
                let entry = cache.retry_write(entry_id).await?;
                println!("✓ Re-queued {}", entry.idempotency_key);
            } else {
                let entry = cache.abandon_write(entry_id).await?;
                println!("✓ Dropped {}", entry.idempotency_key);
            }
        }
        "clear" => match positional.get(1) {
            Some(unit_id) => {
                let removed = cache.clear_unit(unit_id).await?;
                println!("✓ Cleared {} ({} files)", unit_id, removed);
            }
            None => {
                let removed = cache.clear_all().await?;
                println!("✓ Cleared all content ({} files)", removed);
            }
        },
        other => {
            println!("Unknown command: {}", other);
            print_help();
        }
    }

    Ok(())
}
