//! In-memory audit log for write operations.
//!
//! Every write the engine applies (or fails to apply) is recorded with its
//! outcome. The log is a bounded ring: old entries fall off the back.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of retained audit entries.
const DEFAULT_CAPACITY: usize = 1000;

/// One audited operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Operation kind: add, modify, delete, modrdn, bind.
    pub action: String,
    /// Target DN.
    pub target: String,
    pub success: bool,
    /// Result detail: "success" or the fault message.
    pub detail: String,
}

impl AuditEntry {
    pub fn success(action: &str, target: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action: action.to_string(),
            target: target.to_string(),
            success: true,
            detail: "success".to_string(),
        }
    }

    pub fn failure(action: &str, target: &str, detail: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action: action.to_string(),
            target: target.to_string(),
            success: false,
            detail: detail.to_string(),
        }
    }
}

/// Bounded in-memory audit ring.
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let log = AuditLog::new(10);
        log.record(AuditEntry::success("add", "cn=a,dc=x"));
        log.record(AuditEntry::failure("delete", "cn=b,dc=x", "busy (51)"));

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "delete");
        assert!(!recent[0].success);
        assert_eq!(recent[1].action, "add");
        assert!(recent[1].success);
    }

    #[test]
    fn test_bounded_ring_drops_oldest() {
        let log = AuditLog::new(2);
        log.record(AuditEntry::success("add", "cn=1"));
        log.record(AuditEntry::success("add", "cn=2"));
        log.record(AuditEntry::success("add", "cn=3"));

        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent[0].target, "cn=3");
        assert_eq!(recent[1].target, "cn=2");
    }
}
