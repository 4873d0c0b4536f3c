//! Pure scheduling logic: due selection, batching and bookkeeping.
//! No I/O here, so every rule is unit-testable without a runtime.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::engine::types::{ScheduledTask, TaskStatus};

/// Ids of tasks that should run now, highest priority first, then the most
/// overdue first.
pub fn select_due(tasks: &HashMap<String, ScheduledTask>, now: DateTime<Utc>) -> Vec<String> {
    let mut due: Vec<&ScheduledTask> = tasks.values().filter(|t| t.is_due(now)).collect();
    due.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.next_sync_time.cmp(&b.next_sync_time))
            .then(a.id.cmp(&b.id))
    });
    due.into_iter().map(|t| t.id.clone()).collect()
}

/// Split `items` into consecutive batches of at most `cap` (a cap of 0 is
/// treated as 1).
pub fn partition_batches<T: Clone>(items: &[T], cap: usize) -> Vec<Vec<T>> {
    items.chunks(cap.max(1)).map(|chunk| chunk.to_vec()).collect()
}

pub fn compute_next(now: DateTime<Utc>, interval_minutes: u32) -> DateTime<Utc> {
    now + Duration::minutes(i64::from(interval_minutes))
}

/// Status after a run finishes. A task disabled mid-run stays disabled.
fn settled_status(task: &ScheduledTask, ok: bool) -> TaskStatus {
    match (task.enabled, ok) {
        (false, _) => TaskStatus::Disabled,
        (true, true) => TaskStatus::Succeeded,
        (true, false) => TaskStatus::Failed,
    }
}

pub fn apply_success(task: &mut ScheduledTask, now: DateTime<Utc>, partial_errors: Option<String>) {
    task.status = settled_status(task, true);
    task.error_count = 0;
    task.sync_count += 1;
    task.last_sync_time = Some(now);
    task.next_sync_time = compute_next(now, task.interval_minutes);
    task.last_error = partial_errors;
}

/// Failures still advance `next_sync_time`: a broken account waits for its
/// next natural slot instead of being retried every tick.
pub fn apply_failure(task: &mut ScheduledTask, now: DateTime<Utc>, error: String) {
    task.status = settled_status(task, false);
    task.error_count += 1;
    task.next_sync_time = compute_next(now, task.interval_minutes);
    task.last_error = Some(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 20, 9, 0, 0).unwrap()
    }

    fn task(id: &str, priority: i32, next_offset_min: i64) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            platform: "p".into(),
            account_id: id.into(),
            credential_ref: None,
            interval_minutes: 5,
            priority,
            enabled: true,
            status: TaskStatus::Pending,
            last_sync_time: None,
            next_sync_time: now() + Duration::minutes(next_offset_min),
            sync_count: 0,
            error_count: 0,
            last_error: None,
            current_credential_ref: None,
            initial_url: None,
            created_at: now(),
        }
    }

    #[test]
    fn test_select_due_orders_by_priority_then_time() {
        let mut tasks = HashMap::new();
        for t in [
            task("low_old", 0, -30),
            task("high_new", 5, -1),
            task("high_old", 5, -10),
            task("future", 9, 10),
        ] {
            tasks.insert(t.id.clone(), t);
        }
        let mut disabled = task("disabled", 9, -60);
        disabled.enabled = false;
        tasks.insert(disabled.id.clone(), disabled);
        let mut running = task("running", 9, -60);
        running.status = TaskStatus::Running;
        tasks.insert(running.id.clone(), running);

        assert_eq!(select_due(&tasks, now()), vec!["high_old", "high_new", "low_old"]);
    }

    #[test]
    fn test_partition_batches() {
        let ids: Vec<u32> = (0..7).collect();
        let batches = partition_batches(&ids, 3);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(partition_batches(&ids, 0).len(), 7);
        assert!(partition_batches::<u32>(&[], 3).is_empty());
    }

    #[test]
    fn test_failure_advances_schedule() {
        let mut t = task("a1", 0, 0);
        apply_failure(&mut t, now(), "timed out".into());
        assert_eq!(t.error_count, 1);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.next_sync_time, now() + Duration::minutes(5));
        assert_eq!(t.sync_count, 0);
    }

    #[test]
    fn test_success_resets_error_count() {
        let mut t = task("a1", 0, 0);
        apply_failure(&mut t, now(), "boom".into());
        apply_failure(&mut t, now(), "boom".into());
        apply_success(&mut t, now(), None);
        assert_eq!(t.error_count, 0);
        assert_eq!(t.sync_count, 1);
        assert_eq!(t.last_sync_time, Some(now()));
        assert!(t.last_error.is_none());
        assert_eq!(t.status, TaskStatus::Succeeded);
    }

    #[test]
    fn test_disabled_mid_run_stays_disabled() {
        let mut t = task("a1", 0, 0);
        t.enabled = false;
        apply_success(&mut t, now(), None);
        assert_eq!(t.status, TaskStatus::Disabled);
        apply_failure(&mut t, now(), "x".into());
        assert_eq!(t.status, TaskStatus::Disabled);
    }
}
