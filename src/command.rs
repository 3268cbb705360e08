use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NodeId;

/// Caller-supplied idempotency key. Retrying a submission with the same key
/// never produces a second log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaftId(Uuid);

impl RaftId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RaftId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RaftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A membership change, replicated through the same log/commit path as any
/// other command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TopologyChange {
    /// Add a node to the cluster, either as a voter or a passive observer.
    AddNode { id: NodeId, passive: bool },
    /// Remove a node from the cluster entirely.
    RemoveNode { id: NodeId },
    /// Promote a passive observer to a voting follower.
    PromoteNode { id: NodeId },
}

/// Commands replicated through consensus.
///
/// Closed set, dispatched by pattern match; the serde tag is the
/// serialization contract for the command payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Appended by a fresh leader so a current-term entry exists to commit
    /// over any prior-term tail.
    Noop,
    /// Apply a signed delta to a named counter.
    UpdateValue { key: String, delta: i64 },
    /// Change the cluster topology.
    Reconfigure(TopologyChange),
}

impl Command {
    pub fn is_reconfiguration(&self) -> bool {
        matches!(self, Command::Reconfigure(_))
    }
}
