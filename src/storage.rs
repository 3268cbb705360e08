use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::command::{Command, RaftId};

/// A single entry in the replicated log.
///
/// Entries at or below the commit index are immutable; the log store treats
/// any attempt to rewrite them as a programming error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
    pub id: RaftId,
}

/// Outcome of applying one committed entry, handed back to the submitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub index: u64,
    pub term: u64,
    pub value: serde_json::Value,
}

/// Durable log storage, consumed by the log store adapter.
///
/// Called only from the engine task; writes are assumed durable on return.
pub trait PersistentLog: Send + 'static {
    fn append(&mut self, entries: &[LogEntry]);
    fn entries_from(&self, index: u64) -> Vec<LogEntry>;
    /// Drop every entry with `entry.index >= index`.
    fn truncate_from(&mut self, index: u64);
    fn last_index(&self) -> u64;
    fn term_at(&self, index: u64) -> Option<u64>;
}

/// External state machine fed committed entries, exactly once each, in
/// strict commit order. Expected to be deterministic given the command.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry) -> serde_json::Value;
}

/// Log storage backed by a plain vector. Durability is the caller's problem;
/// used by tests and the demo cluster.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    entries: Vec<LogEntry>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with pre-existing entries, bypassing validation.
    /// Integrity is checked by `LogStore::recover`, not here.
    pub fn seeded(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }
}

impl PersistentLog for InMemoryLog {
    fn append(&mut self, entries: &[LogEntry]) {
        self.entries.extend_from_slice(entries);
    }

    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.index >= index)
            .cloned()
            .collect()
    }

    fn truncate_from(&mut self, index: u64) {
        self.entries.retain(|e| e.index < index);
    }

    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.index == index).map(|e| e.term)
    }
}

/// The counting state machine: `UpdateValue` sums deltas per key and returns
/// the new value; every other command applies as a no-op returning null.
#[derive(Debug, Default)]
pub struct CountingStateMachine {
    values: HashMap<String, i64>,
    applied_count: u64,
}

impl CountingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_of(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    pub fn applied_count(&self) -> u64 {
        self.applied_count
    }
}

impl StateMachine for CountingStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> serde_json::Value {
        self.applied_count += 1;
        match &entry.command {
            Command::UpdateValue { key, delta } => {
                let value = self.values.entry(key.clone()).or_insert(0);
                *value += delta;
                serde_json::json!(*value)
            }
            Command::Noop | Command::Reconfigure(_) => serde_json::Value::Null,
        }
    }
}
