use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::models::{MessageThread, ThreadAttrs, ThreadKey};
use crate::db::{now_ts, DbPool};
use crate::error::AppError;

// ============================================================================
// Row Mappers
// ============================================================================

fn row_to_thread(row: &Row) -> rusqlite::Result<MessageThread> {
    Ok(MessageThread {
        id: row.get("id")?,
        platform: row.get("platform")?,
        account_id: row.get("account_id")?,
        user_id: row.get("user_id")?,
        user_name: row.get("user_name")?,
        avatar: row.get("avatar")?,
        unread_count: row.get("unread_count")?,
        last_message_text: row.get("last_message_text")?,
        last_message_time: row.get("last_message_time")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

// ============================================================================
// Threads
// ============================================================================

/// Insert or update a thread by its unique key; `created_at` survives updates.
/// Works on any connection so it can run inside a caller's transaction.
pub(crate) fn upsert_conn(
    conn: &Connection,
    key: &ThreadKey,
    attrs: &ThreadAttrs,
) -> Result<i64, AppError> {
    if key.user_id.trim().is_empty() {
        return Err(AppError::Validation("Thread user_id must not be empty".into()));
    }
    let user_name = if attrs.user_name.trim().is_empty() {
        key.user_id.as_str()
    } else {
        attrs.user_name.as_str()
    };
    let now = now_ts();

    let id = conn.query_row(
        "INSERT INTO message_threads
         (platform, account_id, user_id, user_name, avatar, unread_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
         ON CONFLICT(platform, account_id, user_id) DO UPDATE SET
            user_name  = excluded.user_name,
            avatar     = COALESCE(excluded.avatar, message_threads.avatar),
            updated_at = excluded.updated_at
         RETURNING id",
        params![key.platform, key.account_id, key.user_id, user_name, attrs.avatar, now],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn upsert(pool: &DbPool, key: &ThreadKey, attrs: &ThreadAttrs) -> Result<i64, AppError> {
    let conn = pool.get()?;
    upsert_conn(&conn, key, attrs)
}

pub fn get_by_id(pool: &DbPool, id: i64) -> Result<MessageThread, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM message_threads WHERE id = ?1",
        params![id],
        row_to_thread,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("MessageThread {id}")),
        other => AppError::Database(other),
    })
}

pub fn get_by_key(pool: &DbPool, key: &ThreadKey) -> Result<Option<MessageThread>, AppError> {
    let conn = pool.get()?;
    let thread = conn
        .query_row(
            "SELECT * FROM message_threads
             WHERE platform = ?1 AND account_id = ?2 AND user_id = ?3",
            params![key.platform, key.account_id, key.user_id],
            row_to_thread,
        )
        .optional()?;
    Ok(thread)
}

/// Threads of one account, most recently active first.
pub fn get_by_account(
    pool: &DbPool,
    platform: &str,
    account_id: &str,
) -> Result<Vec<MessageThread>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM message_threads
         WHERE platform = ?1 AND account_id = ?2
         ORDER BY last_message_time IS NULL, last_message_time DESC, id ASC",
    )?;
    let rows = stmt.query_map(params![platform, account_id], row_to_thread)?;
    let threads = rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)?;
    Ok(threads)
}

/// Mark every message of a thread read and zero its unread counter.
pub fn mark_read(pool: &DbPool, id: i64) -> Result<(), AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let rows = tx.execute(
        "UPDATE message_threads SET unread_count = 0, updated_at = ?1 WHERE id = ?2",
        params![now_ts(), id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("MessageThread {id}")));
    }
    tx.execute(
        "UPDATE messages SET is_read = 1 WHERE thread_id = ?1 AND is_read = 0",
        params![id],
    )?;
    tx.commit()?;
    Ok(())
}

/// Delete a thread row. Its messages are left in place and reclaimed by
/// `sync::repair_consistency`.
pub fn delete(pool: &DbPool, id: i64) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM message_threads WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

pub fn count(pool: &DbPool) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM message_threads", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    fn key(user_id: &str) -> ThreadKey {
        ThreadKey {
            platform: "xiaohongshu".into(),
            account_id: "acct-a".into(),
            user_id: user_id.into(),
        }
    }

    fn attrs(name: &str, avatar: Option<&str>) -> ThreadAttrs {
        ThreadAttrs {
            user_name: name.into(),
            avatar: avatar.map(String::from),
        }
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let pool = init_test_db().unwrap();

        let id = upsert(&pool, &key("u1"), &attrs("Alice", Some("a.png"))).unwrap();
        let created = get_by_id(&pool, id).unwrap();
        assert_eq!(created.user_name, "Alice");
        assert_eq!(created.unread_count, 0);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let same_id = upsert(&pool, &key("u1"), &attrs("Alice B.", None)).unwrap();
        assert_eq!(id, same_id);

        let updated = get_by_id(&pool, id).unwrap();
        assert_eq!(updated.user_name, "Alice B.");
        // A missing avatar keeps the stored one
        assert_eq!(updated.avatar.as_deref(), Some("a.png"));
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(count(&pool).unwrap(), 1);
    }

    #[test]
    fn test_upsert_rejects_empty_user_id() {
        let pool = init_test_db().unwrap();
        let err = upsert(&pool, &key("  "), &attrs("x", None)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_empty_name_falls_back_to_user_id() {
        let pool = init_test_db().unwrap();
        let id = upsert(&pool, &key("u9"), &attrs("", None)).unwrap();
        assert_eq!(get_by_id(&pool, id).unwrap().user_name, "u9");
    }

    #[test]
    fn test_get_by_key_and_account() {
        let pool = init_test_db().unwrap();
        upsert(&pool, &key("u1"), &attrs("A", None)).unwrap();
        upsert(&pool, &key("u2"), &attrs("B", None)).unwrap();

        assert!(get_by_key(&pool, &key("u1")).unwrap().is_some());
        assert!(get_by_key(&pool, &key("nobody")).unwrap().is_none());
        assert_eq!(get_by_account(&pool, "xiaohongshu", "acct-a").unwrap().len(), 2);
        assert!(get_by_account(&pool, "xiaohongshu", "other").unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_not_found() {
        let pool = init_test_db().unwrap();
        let id = upsert(&pool, &key("u1"), &attrs("A", None)).unwrap();
        assert!(delete(&pool, id).unwrap());
        assert!(!delete(&pool, id).unwrap());
        assert!(matches!(get_by_id(&pool, id), Err(AppError::NotFound(_))));
        assert!(matches!(mark_read(&pool, id), Err(AppError::NotFound(_))));
    }
}
