use thiserror::Error;

use crate::config::NodeId;

/// Errors surfaced by the consensus engine.
///
/// Only `NotLeading` and `Timeout` reach command submitters; replication and
/// election failures are absorbed by internal retry and never propagate.
#[derive(Error, Debug, Clone)]
pub enum ConsensusError {
    /// This node is not (or stopped being) the leader before the command
    /// committed. Retry against the hinted leader, if any.
    #[error("not leading, known leader is {leader_hint:?}")]
    NotLeading { leader_hint: Option<NodeId> },

    /// The command did not reach a majority within the operation deadline.
    #[error("command was not acknowledged by a majority within the operation deadline")]
    Timeout,

    /// The persisted log failed its startup integrity check. The node must
    /// not rejoin the voting set until the log is repaired.
    #[error("persisted log failed integrity check: {0}")]
    CorruptLog(String),

    /// The engine task has stopped.
    #[error("consensus engine is shut down")]
    Shutdown,
}

impl ConsensusError {
    /// True for the two failure modes a submitter is expected to retry on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsensusError::NotLeading { .. } | ConsensusError::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
