//! In-memory audit stream
//!
//! A bounded ring buffer of structured records threaded through every
//! execution by correlation id. Consumers read snapshots; nothing here
//! persists across process restarts.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default number of records the ring retains.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// One structured audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Wall-clock timestamp of the record
    pub ts: DateTime<Utc>,
    /// Correlation id of the execution that produced it
    pub correlation_id: String,
    /// Record kind (`sequence.started`, `step.completed`, …)
    pub kind: String,
    /// Kind-specific payload
    pub data: serde_json::Value,
}

/// Bounded ring buffer of audit records.
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl AuditLog {
    /// Create a log retaining at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, evicting the oldest when full.
    pub fn record(
        &self,
        correlation_id: impl Into<String>,
        kind: impl Into<String>,
        data: serde_json::Value,
    ) {
        let record = AuditRecord {
            ts: Utc::now(),
            correlation_id: correlation_id.into(),
            kind: kind.into(),
            data,
        };
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Records of one kind, oldest first.
    pub fn of_kind(&self, kind: &str) -> Vec<AuditRecord> {
        self.ring
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}
