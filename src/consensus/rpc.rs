use serde::{Deserialize, Serialize};

use crate::config::NodeId;
use crate::consensus::log::{AppendOutcome, LogStore};
use crate::consensus::state::{NodeState, Role};
use crate::storage::LogEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index this node's log matches the leader's; on rejection a
    /// hint for where the leader should back up to.
    pub match_index: u64,
}

/// Handle a RequestVote RPC.
///
/// Grant iff the requester's term is at least ours, its log is at least as
/// recent by the (last term, last index) order, and we have not voted for a
/// different candidate this term. Passive observers never vote.
pub fn handle_request_vote(
    state: &mut NodeState,
    log: &LogStore,
    req: &VoteRequest,
) -> VoteResponse {
    // A candidate outside the voting membership (typically a removed node
    // that has not yet learned of its removal) cannot start elections here,
    // and its inflated term is not adopted.
    if !state.membership.is_voter(req.candidate_id) {
        return VoteResponse {
            term: state.current_term,
            vote_granted: false,
        };
    }

    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.role == Role::Passive {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        false
    } else if !state.log_is_up_to_date(
        log.last_term(),
        log.last_index(),
        req.last_log_term,
        req.last_log_index,
    ) {
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = state.id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote handled"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle an AppendEntries RPC (heartbeat or replication).
///
/// A valid request from the current term's leader demotes a candidate or a
/// stale leader, records the leader hint, reconciles the log, and advances
/// the commit index up to the local log tail.
pub fn handle_append_entries(
    state: &mut NodeState,
    log: &mut LogStore,
    req: AppendEntriesRequest,
) -> AppendEntriesResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    if req.term < state.current_term {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: log.last_index(),
        };
    }

    if matches!(state.role, Role::Candidate | Role::Leader) {
        state.become_follower(req.term);
    }
    state.leader_hint = Some(req.leader_id);

    let outcome = log.append_from_leader(req.prev_log_index, req.prev_log_term, req.entries);
    let matched = match outcome {
        AppendOutcome::Appended { last_index } => last_index,
        AppendOutcome::MissingPrev | AppendOutcome::Conflict => {
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: log.last_index(),
            };
        }
    };

    if req.leader_commit > state.commit_index {
        let new_commit = req.leader_commit.min(matched);
        if new_commit > state.commit_index {
            state.commit_index = new_commit;
            log.set_commit_floor(new_commit);
        }
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: matched,
    }
}
