use rusqlite::{params, Connection, Row};

use crate::db::models::{AppendResult, Message, NewMessage};
use crate::db::{fmt_ts, now_ts, DbPool};
use crate::error::AppError;

// ============================================================================
// Row Mappers
// ============================================================================

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get("id")?,
        thread_id: row.get("thread_id")?,
        message_id: row.get("message_id")?,
        sender: row.get("sender")?,
        content_type: row.get("content_type")?,
        text_content: row.get("text_content")?,
        image_urls: row.get("image_urls")?,
        content_hash: row.get("content_hash")?,
        timestamp: row.get("timestamp")?,
        is_read: row.get::<_, i32>("is_read")? != 0,
        created_at: row.get("created_at")?,
    })
}

/// Preview text for a thread list. Must stay in sync with the expression used
/// by `sync::repair_consistency`.
fn preview_text(content_type: &str, text: Option<&str>) -> String {
    match text {
        Some(t) => t.to_string(),
        None => format!("[{content_type}]"),
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Append messages to a thread, skipping any whose `(thread_id, timestamp,
/// sender)` already exists. On at least one insert the thread's derived
/// fields move forward; they never move backwards.
pub(crate) fn append_conn(
    conn: &Connection,
    thread_id: i64,
    messages: &[NewMessage],
) -> Result<AppendResult, AppError> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM message_threads WHERE id = ?1",
            params![thread_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)?;
    if !exists {
        return Err(AppError::NotFound(format!("MessageThread {thread_id}")));
    }

    let now = now_ts();
    let mut result = AppendResult::default();
    let mut newest: Option<(String, String)> = None;
    let mut unread_added: i64 = 0;

    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO messages
         (thread_id, message_id, sender, content_type, text_content, image_urls,
          content_hash, timestamp, is_read, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;

    for msg in messages {
        let ts = fmt_ts(&msg.timestamp);
        let content_type = msg.content_type.as_deref().unwrap_or("text");
        let image_urls = if msg.image_urls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&msg.image_urls)?)
        };

        let changed = stmt.execute(params![
            thread_id,
            msg.message_id,
            msg.sender.as_str(),
            content_type,
            msg.text_content,
            image_urls,
            msg.content_hash,
            ts,
            msg.is_read as i32,
            now,
        ])?;

        if changed == 0 {
            result.skipped += 1;
            continue;
        }
        result.inserted += 1;
        if msg.sender.is_remote() && !msg.is_read {
            unread_added += 1;
        }
        if newest.as_ref().map_or(true, |(best, _)| ts >= *best) {
            newest = Some((ts, preview_text(content_type, msg.text_content.as_deref())));
        }
    }

    if let Some((newest_ts, preview)) = newest {
        conn.execute(
            "UPDATE message_threads SET
                last_message_text = CASE
                    WHEN last_message_time IS NULL OR last_message_time <= ?1 THEN ?2
                    ELSE last_message_text END,
                last_message_time = CASE
                    WHEN last_message_time IS NULL OR last_message_time < ?1 THEN ?1
                    ELSE last_message_time END,
                unread_count = unread_count + ?3,
                updated_at = ?4
             WHERE id = ?5",
            params![newest_ts, preview, unread_added, now, thread_id],
        )?;
    }

    tracing::debug!(
        thread_id,
        inserted = result.inserted,
        skipped = result.skipped,
        "Appended messages"
    );
    Ok(result)
}

/// Append messages to a thread in a single transaction.
pub fn append(
    pool: &DbPool,
    thread_id: i64,
    messages: &[NewMessage],
) -> Result<AppendResult, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let result = append_conn(&tx, thread_id, messages)?;
    tx.commit()?;
    Ok(result)
}

/// Messages of a thread in chronological order.
pub fn get_by_thread(
    pool: &DbPool,
    thread_id: i64,
    limit: Option<i64>,
) -> Result<Vec<Message>, AppError> {
    let limit = limit.unwrap_or(200);
    let conn = pool.get()?;

    let mut stmt = conn.prepare(
        "SELECT * FROM messages
         WHERE thread_id = ?1
         ORDER BY timestamp ASC, id ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![thread_id, limit], row_to_message)?;
    let messages = rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)?;
    Ok(messages)
}

pub fn count(pool: &DbPool) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
    Ok(count)
}
