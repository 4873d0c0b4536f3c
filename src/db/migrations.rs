use rusqlite::Connection;

use crate::error::AppError;

/// Run the schema migration. Every statement is idempotent.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;
    run_incremental(conn)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

/// Column additions for databases created before the column existed.
fn run_incremental(conn: &Connection) -> Result<(), AppError> {
    let has_content_hash: bool = conn
        .prepare("SELECT COUNT(*) FROM pragma_table_info('messages') WHERE name = 'content_hash'")?
        .query_row([], |row| row.get::<_, i64>(0))
        .map(|c| c > 0)
        .unwrap_or(false);

    if !has_content_hash {
        conn.execute_batch("ALTER TABLE messages ADD COLUMN content_hash TEXT;")?;
        tracing::info!("Added content_hash column to messages");
    }

    Ok(())
}

// messages.thread_id has no FOREIGN KEY: threads can be deleted on their own
// and repair_consistency reclaims the orphaned messages.
const SCHEMA: &str = r#"

-- ============================================================================
-- Message Threads
-- ============================================================================

CREATE TABLE IF NOT EXISTS message_threads (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    platform            TEXT NOT NULL,
    account_id          TEXT NOT NULL,
    user_id             TEXT NOT NULL,
    user_name           TEXT NOT NULL,
    avatar              TEXT,
    unread_count        INTEGER NOT NULL DEFAULT 0,
    last_message_text   TEXT,
    last_message_time   TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    UNIQUE(platform, account_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_threads_account ON message_threads(platform, account_id);
CREATE INDEX IF NOT EXISTS idx_threads_last_msg ON message_threads(last_message_time);

-- ============================================================================
-- Messages
-- ============================================================================

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id       INTEGER NOT NULL,
    message_id      TEXT,
    sender          TEXT NOT NULL CHECK (sender IN ('me', 'user')),
    content_type    TEXT NOT NULL DEFAULT 'text',
    text_content    TEXT,
    image_urls      TEXT,
    timestamp       TEXT NOT NULL,
    is_read         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    UNIQUE(thread_id, timestamp, sender)
);
CREATE INDEX IF NOT EXISTS idx_messages_thread_ts ON messages(thread_id, timestamp);

-- ============================================================================
-- Sync Watermarks
-- ============================================================================

CREATE TABLE IF NOT EXISTS sync_watermarks (
    platform        TEXT NOT NULL,
    account_id      TEXT NOT NULL,
    last_sync_time  TEXT,
    sync_count      INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (platform, account_id)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let cols: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('messages') WHERE name = 'content_hash'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(cols, 1);
    }
}
