use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::models::SyncWatermark;
use crate::db::{now_ts, DbPool};
use crate::error::AppError;

fn row_to_watermark(row: &Row) -> rusqlite::Result<SyncWatermark> {
    Ok(SyncWatermark {
        platform: row.get("platform")?,
        account_id: row.get("account_id")?,
        last_sync_time: row.get("last_sync_time")?,
        sync_count: row.get("sync_count")?,
        last_error: row.get("last_error")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn get_conn(
    conn: &Connection,
    platform: &str,
    account_id: &str,
) -> Result<Option<SyncWatermark>, AppError> {
    let watermark = conn
        .query_row(
            "SELECT * FROM sync_watermarks WHERE platform = ?1 AND account_id = ?2",
            params![platform, account_id],
            row_to_watermark,
        )
        .optional()?;
    Ok(watermark)
}

pub fn get(pool: &DbPool, platform: &str, account_id: &str) -> Result<Option<SyncWatermark>, AppError> {
    let conn = pool.get()?;
    get_conn(&conn, platform, account_id)
}

/// Record one completed sync pass. `newest` only moves the watermark forward;
/// `last_error` replaces the previous error (None clears it).
pub(crate) fn advance_conn(
    conn: &Connection,
    platform: &str,
    account_id: &str,
    newest: Option<&str>,
    last_error: Option<&str>,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO sync_watermarks
         (platform, account_id, last_sync_time, sync_count, last_error, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5)
         ON CONFLICT(platform, account_id) DO UPDATE SET
            last_sync_time = CASE
                WHEN excluded.last_sync_time IS NOT NULL
                 AND (sync_watermarks.last_sync_time IS NULL
                      OR excluded.last_sync_time > sync_watermarks.last_sync_time)
                THEN excluded.last_sync_time
                ELSE sync_watermarks.last_sync_time END,
            sync_count = sync_watermarks.sync_count + 1,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![platform, account_id, newest, last_error, now_ts()],
    )?;
    Ok(())
}

/// Record a failed sync attempt without touching the watermark or counter.
pub fn record_error(
    pool: &DbPool,
    platform: &str,
    account_id: &str,
    error: &str,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO sync_watermarks
         (platform, account_id, last_sync_time, sync_count, last_error, updated_at)
         VALUES (?1, ?2, NULL, 0, ?3, ?4)
         ON CONFLICT(platform, account_id) DO UPDATE SET
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![platform, account_id, error, now_ts()],
    )?;
    Ok(())
}
