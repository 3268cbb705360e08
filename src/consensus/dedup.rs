use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::command::RaftId;
use crate::storage::Applied;

/// What the deduplicator knows about an idempotency key.
#[derive(Debug, Clone)]
pub enum DedupState {
    /// The command sits in the log at `index`, waiting for commit. A
    /// duplicate submission attaches to the same pending outcome.
    Pending { index: u64 },
    /// The command committed and applied; a duplicate gets the recorded
    /// outcome immediately.
    Applied {
        outcome: Applied,
        completed_at: Instant,
    },
}

/// Maps idempotency keys to their submission outcome so retried commands
/// never double-append or double-apply.
///
/// Applied entries are retained for a grace period to answer slightly
/// delayed retries, then evicted to bound memory. Pending entries are never
/// evicted by the sweep; they resolve through commit or failure first.
pub struct Deduplicator {
    entries: HashMap<RaftId, DedupState>,
    retention: Duration,
}

impl Deduplicator {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
        }
    }

    pub fn lookup(&self, id: &RaftId) -> Option<&DedupState> {
        self.entries.get(id)
    }

    pub fn register_pending(&mut self, id: RaftId, index: u64) {
        self.entries.insert(id, DedupState::Pending { index });
    }

    pub fn mark_applied(&mut self, id: RaftId, outcome: Applied, now: Instant) {
        self.entries.insert(
            id,
            DedupState::Applied {
                outcome,
                completed_at: now,
            },
        );
    }

    /// Drop a key whose submission resolved with a failure; a retry is a
    /// fresh submission.
    pub fn forget(&mut self, id: &RaftId) {
        self.entries.remove(id);
    }

    /// Evict applied entries past the retention grace period.
    pub fn sweep(&mut self, now: Instant) {
        let retention = self.retention;
        self.entries.retain(|_, state| match state {
            DedupState::Pending { .. } => true,
            DedupState::Applied { completed_at, .. } => {
                now.duration_since(*completed_at) < retention
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(index: u64) -> Applied {
        Applied {
            index,
            term: 1,
            value: serde_json::Value::Null,
        }
    }

    #[test]
    fn lookup_pending_then_applied() {
        let mut dedup = Deduplicator::new(Duration::from_secs(1));
        let id = RaftId::new();
        assert!(dedup.lookup(&id).is_none());

        dedup.register_pending(id, 5);
        assert!(matches!(
            dedup.lookup(&id),
            Some(DedupState::Pending { index: 5 })
        ));

        dedup.mark_applied(id, applied(5), Instant::now());
        match dedup.lookup(&id) {
            Some(DedupState::Applied { outcome, .. }) => assert_eq!(outcome.index, 5),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn sweep_evicts_only_expired_applied_entries() {
        let mut dedup = Deduplicator::new(Duration::from_millis(100));
        let now = Instant::now();

        let fresh = RaftId::new();
        let stale = RaftId::new();
        let pending = RaftId::new();
        dedup.mark_applied(fresh, applied(1), now);
        dedup.mark_applied(stale, applied(2), now - Duration::from_millis(500));
        dedup.register_pending(pending, 3);

        dedup.sweep(now);
        assert!(dedup.lookup(&fresh).is_some());
        assert!(dedup.lookup(&stale).is_none());
        assert!(dedup.lookup(&pending).is_some(), "pending is never evicted");
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn forget_removes_failed_submission() {
        let mut dedup = Deduplicator::new(Duration::from_secs(1));
        let id = RaftId::new();
        dedup.register_pending(id, 9);
        dedup.forget(&id);
        assert!(dedup.is_empty());
    }
}
