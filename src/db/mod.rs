pub mod migrations;
pub mod models;
pub mod repos;

use std::path::Path;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Canonical text form for stored timestamps: RFC 3339, UTC, microsecond
/// precision, `Z` suffix. Messages are deduplicated on this text, so two
/// messages from one sender less than 1µs apart collapse into one row. Lexicographic order equals chronological order,
/// which the watermark and `MAX(timestamp)` comparisons rely on.
pub fn fmt_ts(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    fmt_ts(&chrono::Utc::now())
}

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA cache_size = -8000;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

/// Initialize the database: create file, enable WAL, run migrations.
pub fn init_db(data_dir: &Path, config: &StoreConfig) -> Result<DbPool, AppError> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(&config.database_file);

    tracing::info!(path = %db_path.display(), "Initializing database");

    let manager = SqliteConnectionManager::file(&db_path);
    let pool = Pool::builder()
        .max_size(config.pool_size)
        .connection_customizer(Box::new(SqlitePragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(manager)?;

    // WAL journal mode is database-wide, only needs to run once
    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA wal_autocheckpoint = 1000;")?;
        tracing::debug!("SQLite pragmas configured (WAL, FK, busy_timeout)");
    }

    {
        let conn = pool.get()?;
        migrations::run(&conn)?;
    }

    // Fold any WAL left behind by an unclean shutdown into the main file.
    match checkpoint(&pool) {
        Ok(result) => tracing::debug!(?result, "Startup WAL checkpoint complete"),
        Err(e) => tracing::warn!("Startup WAL checkpoint failed: {}", e),
    }

    tracing::info!("Database initialized successfully");
    Ok(pool)
}

/// Result row of `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointResult {
    /// 1 if the checkpoint was blocked by a concurrent reader/writer.
    pub busy: i64,
    /// Frames in the WAL file (-1 when not in WAL mode).
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Force a truncating WAL checkpoint so committed data lands in the main
/// database file and the WAL does not grow unbounded.
pub fn checkpoint(pool: &DbPool) -> Result<CheckpointResult, AppError> {
    let conn = pool.get()?;
    let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
        Ok(CheckpointResult {
            busy: row.get(0)?,
            log_frames: row.get(1)?,
            checkpointed_frames: row.get(2)?,
        })
    })?;
    if result.busy != 0 {
        tracing::warn!(?result, "WAL checkpoint was blocked by an active connection");
    }
    Ok(result)
}

#[cfg(test)]
pub fn init_test_db() -> Result<DbPool, AppError> {
    use std::time::Duration;

    // Use a unique temp file for each test to avoid in-memory connection issues with r2d2.
    let tmp = std::env::temp_dir().join(format!("mab_test_{}.db", uuid::Uuid::new_v4()));
    let manager = SqliteConnectionManager::file(&tmp);
    let pool = Pool::builder()
        .max_size(2)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(SqlitePragmaCustomizer {
            busy_timeout_ms: 5_000,
        }))
        .build(manager)?;

    let conn = pool.get()?;
    migrations::run(&conn)?;
    drop(conn);
    Ok(pool)
}
