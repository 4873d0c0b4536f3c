//! Credential rotation history.
//!
//! Rotations themselves are a single field swap on the task; this keeps a
//! bounded, newest-last log of them for status queries.

use std::collections::VecDeque;

use crate::db::now_ts;
use crate::engine::context::AccountKey;
use crate::engine::types::RotationRecord;

#[derive(Debug)]
pub struct RotationLog {
    limit: usize,
    records: VecDeque<RotationRecord>,
}

impl RotationLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            records: VecDeque::with_capacity(limit.min(64)),
        }
    }

    pub fn record(
        &mut self,
        account: &AccountKey,
        previous_ref: Option<String>,
        new_ref: &str,
        reason: &str,
    ) {
        if self.limit == 0 {
            return;
        }
        while self.records.len() >= self.limit {
            self.records.pop_front();
        }
        self.records.push_back(RotationRecord {
            account: account.to_string(),
            previous_ref,
            new_ref: new_ref.to_string(),
            reason: reason.to_string(),
            rotated_at: now_ts(),
        });
    }

    pub fn snapshot(&self) -> Vec<RotationRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let mut log = RotationLog::new(2);
        let key = AccountKey::new("p", "a1");
        log.record(&key, None, "c1", "initial login");
        log.record(&key, Some("c1".into()), "c2", "cookie refresh");
        log.record(&key, Some("c2".into()), "c3", "cookie refresh");

        let records = log.snapshot();
        assert_eq!(log.len(), 2);
        assert_eq!(records[0].new_ref, "c2");
        assert_eq!(records[1].new_ref, "c3");
        assert_eq!(records[1].previous_ref.as_deref(), Some("c2"));
        assert_eq!(records[1].account, "p:a1");
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let mut log = RotationLog::new(0);
        log.record(&AccountKey::new("p", "a1"), None, "c1", "x");
        assert!(log.snapshot().is_empty());
    }
}
