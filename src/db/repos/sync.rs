//! Incremental merge, consistency repair and health diagnostics over the
//! thread/message/watermark tables.

use rusqlite::{Connection, OptionalExtension};

use crate::db::models::{
    AppendResult, HealthReport, IncrementalSyncResult, RepairReport, ThreadKey, ThreadPayload,
};
use crate::db::repos::{messages, threads, watermarks};
use crate::db::{fmt_ts, DbPool};
use crate::error::AppError;

/// Merge one sync pass for an account.
///
/// Runs in a single transaction. Each thread is applied inside its own
/// savepoint, so a failing thread is rolled back and reported in `errors`
/// while the rest of the batch commits. Only messages newer than the account
/// watermark are considered. The watermark always advances at the end (to the
/// newest timestamp in the payload), including when some threads failed.
pub fn incremental_sync(
    pool: &DbPool,
    platform: &str,
    account_id: &str,
    payload: &[ThreadPayload],
) -> Result<IncrementalSyncResult, AppError> {
    let mut conn = pool.get()?;
    let mut tx = conn.transaction()?;

    let watermark = watermarks::get_conn(&tx, platform, account_id)?.and_then(|w| w.last_sync_time);
    let mut result = IncrementalSyncResult::default();

    let newest_in_payload = payload
        .iter()
        .flat_map(|t| t.messages.iter())
        .map(|m| fmt_ts(&m.timestamp))
        .max();

    for thread in payload {
        let sp = tx.savepoint()?;
        match merge_thread(&sp, platform, account_id, thread, watermark.as_deref()) {
            Ok(appended) => {
                sp.commit()?;
                result.updated_threads += 1;
                result.new_messages += appended.inserted;
            }
            Err(e) => {
                // Dropping the savepoint rolls back this thread only
                drop(sp);
                tracing::warn!(
                    platform,
                    account_id,
                    user_id = %thread.user_id,
                    "Incremental sync: thread failed: {}",
                    e
                );
                result.errors.push(format!("thread {}: {}", thread.user_id, e));
            }
        }
    }

    let error_summary = if result.errors.is_empty() {
        None
    } else {
        Some(result.errors.join("; "))
    };
    watermarks::advance_conn(
        &tx,
        platform,
        account_id,
        newest_in_payload.as_deref(),
        error_summary.as_deref(),
    )?;
    tx.commit()?;

    tracing::info!(
        platform,
        account_id,
        new_messages = result.new_messages,
        updated_threads = result.updated_threads,
        errors = result.errors.len(),
        "Incremental sync merged"
    );
    Ok(result)
}

fn merge_thread(
    conn: &Connection,
    platform: &str,
    account_id: &str,
    thread: &ThreadPayload,
    watermark: Option<&str>,
) -> Result<AppendResult, AppError> {
    let key = ThreadKey {
        platform: platform.to_string(),
        account_id: account_id.to_string(),
        user_id: thread.user_id.clone(),
    };
    let thread_id = threads::upsert_conn(conn, &key, &thread.attrs)?;

    let fresh: Vec<_> = thread
        .messages
        .iter()
        .filter(|m| watermark.map_or(true, |w| fmt_ts(&m.timestamp).as_str() > w))
        .cloned()
        .collect();
    if fresh.is_empty() {
        return Ok(AppendResult::default());
    }
    messages::append_conn(conn, thread_id, &fresh)
}

/// Recompute every thread's derived fields from its messages and delete
/// messages whose thread no longer exists. Safe to run repeatedly.
pub fn repair_consistency(pool: &DbPool) -> Result<RepairReport, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let orphaned = tx.execute(
        "DELETE FROM messages WHERE thread_id NOT IN (SELECT id FROM message_threads)",
        [],
    )?;

    let drifted: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM message_threads t WHERE {DRIFT_PREDICATE}"), [], |row| {
        row.get(0)
    })?;

    let repaired = tx.execute(
        "UPDATE message_threads SET
            last_message_time = (
                SELECT MAX(m.timestamp) FROM messages m WHERE m.thread_id = message_threads.id),
            last_message_text = (
                SELECT COALESCE(m.text_content, '[' || m.content_type || ']')
                FROM messages m WHERE m.thread_id = message_threads.id
                ORDER BY m.timestamp DESC, m.id DESC LIMIT 1),
            unread_count = (
                SELECT COUNT(*) FROM messages m
                WHERE m.thread_id = message_threads.id AND m.sender = 'user' AND m.is_read = 0)",
        [],
    )?;

    tx.commit()?;

    let report = RepairReport {
        repaired_threads: repaired,
        drifted_threads: drifted as usize,
        orphaned_messages: orphaned,
    };
    if report.drifted_threads > 0 || report.orphaned_messages > 0 {
        tracing::warn!(?report, "Consistency repair fixed drift");
    } else {
        tracing::debug!(?report, "Consistency repair found no drift");
    }
    Ok(report)
}

/// Threads whose stored derived fields disagree with their messages.
const DRIFT_PREDICATE: &str = "
    t.last_message_time IS NOT (SELECT MAX(m.timestamp) FROM messages m WHERE m.thread_id = t.id)
    OR t.unread_count != (
        SELECT COUNT(*) FROM messages m
        WHERE m.thread_id = t.id AND m.sender = 'user' AND m.is_read = 0)";

/// Read-only diagnostic. Never mutates the store.
pub fn health_check(pool: &DbPool) -> Result<HealthReport, AppError> {
    let conn = pool.get()?;

    let orphaned_messages: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE thread_id NOT IN (SELECT id FROM message_threads)",
        [],
        |row| row.get(0),
    )?;
    let empty_threads: i64 = conn.query_row(
        "SELECT COUNT(*) FROM message_threads t
         WHERE NOT EXISTS (SELECT 1 FROM messages m WHERE m.thread_id = t.id)",
        [],
        |row| row.get(0),
    )?;
    let inconsistent_threads: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM message_threads t WHERE {DRIFT_PREDICATE}"),
        [],
        |row| row.get(0),
    )?;
    let integrity: Option<String> = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .optional()?;
    let integrity_ok = integrity.as_deref() == Some("ok");

    let mut issues = Vec::new();
    let mut suggestions = Vec::new();
    if orphaned_messages > 0 {
        issues.push(format!("{orphaned_messages} messages reference missing threads"));
        suggestions.push("Run repair_consistency to delete orphaned messages".to_string());
    }
    if inconsistent_threads > 0 {
        issues.push(format!(
            "{inconsistent_threads} threads have stale last_message_time or unread_count"
        ));
        suggestions.push("Run repair_consistency to recompute thread summaries".to_string());
    }
    if empty_threads > 0 {
        issues.push(format!("{empty_threads} threads have no messages"));
        suggestions.push("Re-sync the affected accounts to backfill message history".to_string());
    }
    if !integrity_ok {
        issues.push(format!(
            "SQLite quick_check reported: {}",
            integrity.as_deref().unwrap_or("no result")
        ));
        suggestions.push("Restore the database from backup or rebuild it".to_string());
    }

    Ok(HealthReport {
        is_healthy: issues.is_empty(),
        issues,
        suggestions,
        orphaned_messages,
        empty_threads,
        inconsistent_threads,
        integrity_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{MessageSender, NewMessage, ThreadAttrs};
    use chrono::{DateTime, TimeZone, Utc};
    use rusqlite::params;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 20, 8, minute, 0).unwrap()
    }

    fn payload(user_id: &str, msgs: Vec<NewMessage>) -> ThreadPayload {
        ThreadPayload {
            user_id: user_id.into(),
            attrs: ThreadAttrs {
                user_name: format!("name-{user_id}"),
                avatar: None,
            },
            messages: msgs,
        }
    }

    fn sample_payload() -> Vec<ThreadPayload> {
        vec![
            payload(
                "u1",
                vec![
                    NewMessage::text(MessageSender::User, "hi", ts(1)),
                    NewMessage::text(MessageSender::Me, "hello", ts(2)),
                ],
            ),
            payload("u2", vec![NewMessage::text(MessageSender::User, "are you there", ts(3))]),
        ]
    }

    #[test]
    fn test_incremental_sync_twice_is_idempotent() {
        let pool = init_test_db().unwrap();
        let data = sample_payload();

        let first = incremental_sync(&pool, "wechat", "a1", &data).unwrap();
        assert_eq!(first.new_messages, 3);
        assert_eq!(first.updated_threads, 2);
        assert!(first.errors.is_empty());

        let second = incremental_sync(&pool, "wechat", "a1", &data).unwrap();
        assert_eq!(second.new_messages, 0);
        assert!(second.errors.is_empty());
        assert_eq!(threads::count(&pool).unwrap(), 2);
        assert_eq!(messages::count(&pool).unwrap(), 3);

        let wm = watermarks::get(&pool, "wechat", "a1").unwrap().unwrap();
        assert_eq!(wm.sync_count, 2);
        assert_eq!(wm.last_sync_time, Some(fmt_ts(&ts(3))));
    }

    #[test]
    fn test_only_messages_newer_than_watermark_are_merged() {
        let pool = init_test_db().unwrap();
        incremental_sync(&pool, "wechat", "a1", &sample_payload()).unwrap();

        let next = vec![payload(
            "u1",
            vec![
                // older than the watermark: ignored even though it is new
                NewMessage::text(MessageSender::User, "late edit", ts(0)),
                NewMessage::text(MessageSender::User, "new", ts(10)),
            ],
        )];
        let result = incremental_sync(&pool, "wechat", "a1", &next).unwrap();
        assert_eq!(result.new_messages, 1);
        assert_eq!(messages::count(&pool).unwrap(), 4);
    }

    #[test]
    fn test_failed_thread_does_not_abort_batch_and_watermark_advances() {
        let pool = init_test_db().unwrap();
        let data = vec![
            payload("u1", vec![NewMessage::text(MessageSender::User, "ok", ts(1))]),
            payload("", vec![NewMessage::text(MessageSender::User, "broken", ts(20))]),
            payload("u3", vec![NewMessage::text(MessageSender::Me, "ok too", ts(2))]),
        ];

        let result = incremental_sync(&pool, "wechat", "a1", &data).unwrap();
        assert_eq!(result.updated_threads, 2);
        assert_eq!(result.new_messages, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("user_id"));

        let wm = watermarks::get(&pool, "wechat", "a1").unwrap().unwrap();
        assert_eq!(wm.last_sync_time, Some(fmt_ts(&ts(20))));
        assert!(wm.last_error.is_some());

        // A clean pass clears the recorded error
        incremental_sync(&pool, "wechat", "a1", &[]).unwrap();
        let wm = watermarks::get(&pool, "wechat", "a1").unwrap().unwrap();
        assert!(wm.last_error.is_none());
        assert_eq!(wm.sync_count, 2);
    }

    #[test]
    fn test_repair_converges() {
        let pool = init_test_db().unwrap();
        incremental_sync(&pool, "wechat", "a1", &sample_payload()).unwrap();

        // Introduce drift and an orphan
        let doomed = threads::upsert(
            &pool,
            &ThreadKey {
                platform: "wechat".into(),
                account_id: "a1".into(),
                user_id: "u9".into(),
            },
            &ThreadAttrs::default(),
        )
        .unwrap();
        messages::append(&pool, doomed, &[NewMessage::text(MessageSender::User, "bye", ts(5))]).unwrap();
        threads::delete(&pool, doomed).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute(
                "UPDATE message_threads SET unread_count = 42, last_message_time = NULL",
                params![],
            )
            .unwrap();
        }

        let health = health_check(&pool).unwrap();
        assert!(!health.is_healthy);
        assert_eq!(health.orphaned_messages, 1);
        assert_eq!(health.inconsistent_threads, 2);

        let first = repair_consistency(&pool).unwrap();
        assert_eq!(first.orphaned_messages, 1);
        assert_eq!(first.repaired_threads, 2);
        assert_eq!(first.drifted_threads, 2);

        let second = repair_consistency(&pool).unwrap();
        assert_eq!(
            second,
            RepairReport {
                repaired_threads: 2,
                drifted_threads: 0,
                orphaned_messages: 0
            }
        );

        let u1 = threads::get_by_key(
            &pool,
            &ThreadKey {
                platform: "wechat".into(),
                account_id: "a1".into(),
                user_id: "u1".into(),
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(u1.unread_count, 1);
        assert_eq!(u1.last_message_time, Some(fmt_ts(&ts(2))));
        assert_eq!(u1.last_message_text.as_deref(), Some("hello"));

        assert!(health_check(&pool).unwrap().is_healthy);
    }

    #[test]
    fn test_health_check_is_read_only() {
        let pool = init_test_db().unwrap();
        threads::upsert(
            &pool,
            &ThreadKey {
                platform: "wechat".into(),
                account_id: "a1".into(),
                user_id: "lonely".into(),
            },
            &ThreadAttrs::default(),
        )
        .unwrap();

        let report = health_check(&pool).unwrap();
        assert!(!report.is_healthy);
        assert_eq!(report.empty_threads, 1);
        assert!(report.integrity_ok);
        assert_eq!(report.issues.len(), report.suggestions.len());

        // Running it again sees the same state
        assert_eq!(health_check(&pool).unwrap().empty_threads, 1);
        assert_eq!(threads::count(&pool).unwrap(), 1);
    }
}
