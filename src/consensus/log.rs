use crate::command::{Command, RaftId};
use crate::error::{ConsensusError, Result};
use crate::storage::{LogEntry, PersistentLog};

/// Result of a follower-side append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Entries accepted; local log now matches the leader up to `last_index`.
    Appended { last_index: u64 },
    /// No local entry at the leader's `prev_log_index` yet.
    MissingPrev,
    /// The entry at `prev_log_index` carried a different term; the
    /// conflicting suffix was truncated and the leader must back up.
    Conflict,
}

/// In-process, ordered view over the durable log.
///
/// Exclusively owns the log tail: the engine appends through it, followers
/// reconcile through it, and everything at or below the commit floor is
/// immutable. First index is 1.
pub struct LogStore {
    storage: Box<dyn PersistentLog>,
    entries: Vec<LogEntry>,
    commit_floor: u64,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("entries", &self.entries)
            .field("commit_floor", &self.commit_floor)
            .finish_non_exhaustive()
    }
}

impl LogStore {
    /// Load the durable log and verify its shape: gapless indices starting
    /// at 1 and non-decreasing terms. A violation is a startup precondition
    /// failure, not a recoverable runtime condition.
    pub fn recover(storage: Box<dyn PersistentLog>) -> Result<Self> {
        let entries = storage.entries_from(1);
        let mut prev_term = 0;
        for (pos, entry) in entries.iter().enumerate() {
            let expected = pos as u64 + 1;
            if entry.index != expected {
                return Err(ConsensusError::CorruptLog(format!(
                    "expected index {expected}, found {}",
                    entry.index
                )));
            }
            if entry.term < prev_term {
                return Err(ConsensusError::CorruptLog(format!(
                    "term regressed from {prev_term} to {} at index {}",
                    entry.term, entry.index
                )));
            }
            prev_term = entry.term;
        }

        if !entries.is_empty() {
            tracing::info!(
                last_index = entries.len() as u64,
                last_term = prev_term,
                "Recovered durable log"
            );
        }

        Ok(Self {
            storage,
            entries,
            commit_floor: 0,
        })
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entry_at(index).map(|e| e.term)
    }

    /// Entries from `start` (inclusive), capped at `max` per batch.
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        if start == 0 || start > self.last_index() {
            return Vec::new();
        }
        let from = (start - 1) as usize;
        let to = (from + max).min(self.entries.len());
        self.entries[from..to].to_vec()
    }

    /// `(index, term)` pairs for the whole log, for diagnostics and tests.
    pub fn summary(&self) -> Vec<(u64, u64)> {
        self.entries.iter().map(|e| (e.index, e.term)).collect()
    }

    /// Record the new commit index; entries at or below it become immutable.
    pub fn set_commit_floor(&mut self, index: u64) {
        debug_assert!(index >= self.commit_floor);
        self.commit_floor = index;
    }

    /// Leader-side append of a fresh command at the tail.
    pub fn append_leader(&mut self, term: u64, command: Command, id: RaftId) -> u64 {
        let index = self.last_index() + 1;
        let entry = LogEntry {
            index,
            term,
            command,
            id,
        };
        self.storage.append(std::slice::from_ref(&entry));
        self.entries.push(entry);
        index
    }

    /// Follower-side append from an AppendEntries request.
    ///
    /// Checks the (prev_index, prev_term) consistency point, truncates a
    /// conflicting suffix, skips entries already present, and appends the
    /// rest.
    pub fn append_from_leader(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
    ) -> AppendOutcome {
        if prev_index > 0 {
            match self.term_at(prev_index) {
                None => return AppendOutcome::MissingPrev,
                Some(term) if term != prev_term => {
                    self.truncate_from(prev_index);
                    return AppendOutcome::Conflict;
                }
                Some(_) => {}
            }
        }

        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    // Already have it; the log-matching property makes the
                    // whole entry identical.
                }
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.storage.append(std::slice::from_ref(&entry));
                    self.entries.push(entry);
                }
                None => {
                    self.storage.append(std::slice::from_ref(&entry));
                    self.entries.push(entry);
                }
            }
        }

        AppendOutcome::Appended {
            last_index: self.last_index(),
        }
    }

    /// Drop every entry with index >= `index`.
    ///
    /// Panics if the range reaches into committed entries; that can only
    /// happen through a protocol bug and must not be papered over.
    fn truncate_from(&mut self, index: u64) {
        assert!(
            index > self.commit_floor,
            "attempted to truncate committed entries: index {index} <= commit floor {}",
            self.commit_floor
        );
        self.storage.truncate_from(index);
        self.entries.truncate((index - 1) as usize);
        tracing::debug!(from_index = index, "Truncated conflicting log suffix");
    }
}
