use std::collections::BTreeSet;

use crate::command::TopologyChange;
use crate::config::{NodeConfig, NodeId};

/// Role of a node within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    /// Non-voting observer: replicates and applies committed entries but
    /// never votes or campaigns. Promoted to Follower by a committed
    /// reconfiguration command.
    Passive,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
            Role::Passive => write!(f, "passive"),
        }
    }
}

/// Current cluster membership: voters plus passive observers.
///
/// Mutated only by applying a committed `Reconfigure` entry, so every node
/// converges on the same view at the same log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    voters: BTreeSet<NodeId>,
    passives: BTreeSet<NodeId>,
}

impl Membership {
    pub fn from_config(config: &NodeConfig) -> Self {
        let mut voters = BTreeSet::new();
        let mut passives = BTreeSet::new();
        if config.passive {
            passives.insert(config.node_id);
        } else {
            voters.insert(config.node_id);
        }
        for peer in &config.peers {
            if peer.passive {
                passives.insert(peer.node_id);
            } else {
                voters.insert(peer.node_id);
            }
        }
        Self { voters, passives }
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.contains(&id) || self.passives.contains(&id)
    }

    /// Strict majority of the current voting membership.
    pub fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn voter_count(&self) -> usize {
        self.voters.len()
    }

    /// All peers of `self_id`, voters and passives alike.
    pub fn peers_of(&self, self_id: NodeId) -> Vec<NodeId> {
        self.voters
            .iter()
            .chain(self.passives.iter())
            .copied()
            .filter(|&id| id != self_id)
            .collect()
    }

    /// Voting peers of `self_id` (the set that can grant votes).
    pub fn voter_peers_of(&self, self_id: NodeId) -> Vec<NodeId> {
        self.voters
            .iter()
            .copied()
            .filter(|&id| id != self_id)
            .collect()
    }

    /// Apply a committed topology change. Idempotent.
    pub fn apply_change(&mut self, change: &TopologyChange) {
        match *change {
            TopologyChange::AddNode { id, passive } => {
                if passive {
                    if !self.voters.contains(&id) {
                        self.passives.insert(id);
                    }
                } else {
                    self.passives.remove(&id);
                    self.voters.insert(id);
                }
            }
            TopologyChange::RemoveNode { id } => {
                self.voters.remove(&id);
                self.passives.remove(&id);
            }
            TopologyChange::PromoteNode { id } => {
                if self.passives.remove(&id) {
                    self.voters.insert(id);
                }
            }
        }
    }
}

/// Mutable per-node consensus state. Exclusively owned by the engine task;
/// everything else reads published snapshots.
#[derive(Debug)]
pub struct NodeState {
    pub id: NodeId,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub role: Role,
    pub commit_index: u64,
    pub last_applied: u64,
    /// Last node observed acting as leader, used as a retry hint.
    pub leader_hint: Option<NodeId>,
    pub membership: Membership,
}

impl NodeState {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            id: config.node_id,
            current_term: 0,
            voted_for: None,
            role: if config.passive {
                Role::Passive
            } else {
                Role::Follower
            },
            commit_index: 0,
            last_applied: 0,
            leader_hint: None,
            membership: Membership::from_config(config),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Whether this node may start an election.
    pub fn can_campaign(&self) -> bool {
        matches!(self.role, Role::Follower | Role::Candidate) && self.membership.is_voter(self.id)
    }

    /// Observe a term at least as high as ours and drop to a non-leading
    /// role. `voted_for` resets only when the term actually advances, so a
    /// node can never cast two votes in one term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.role != Role::Passive {
            self.role = Role::Follower;
        }
    }

    /// Start a new election round: bump the term and vote for self.
    pub fn become_candidate(&mut self) {
        debug_assert!(self.can_campaign());
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_hint = None;
    }

    pub fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_hint = Some(self.id);
    }

    /// Promote this node out of passive observation.
    pub fn promote(&mut self) {
        if self.role == Role::Passive {
            self.role = Role::Follower;
        }
    }

    /// Demote this node to a passive observer (it left the voting set).
    pub fn demote(&mut self) {
        if self.role != Role::Passive {
            self.role = Role::Passive;
            self.voted_for = None;
        }
    }

    /// Compares a candidate's log recency against ours, per the standard
    /// lexicographic (last term, last index) order.
    pub fn log_is_up_to_date(
        &self,
        our_last_term: u64,
        our_last_index: u64,
        their_last_term: u64,
        their_last_index: u64,
    ) -> bool {
        their_last_term > our_last_term
            || (their_last_term == our_last_term && their_last_index >= our_last_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_3() -> NodeConfig {
        NodeConfig::new(1).with_peer(2).with_peer(3)
    }

    #[test]
    fn new_state_is_follower() {
        let state = NodeState::new(&config_3());
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.commit_index, 0);
    }

    #[test]
    fn passive_config_starts_passive() {
        let mut config = NodeConfig::new(4).with_peer(1).with_peer(2).with_peer(3);
        config.passive = true;
        let state = NodeState::new(&config);
        assert_eq!(state.role, Role::Passive);
        assert!(!state.can_campaign());
        assert!(!state.membership.is_voter(4));
    }

    #[test]
    fn become_candidate_bumps_term_and_self_votes() {
        let mut state = NodeState::new(&config_3());
        state.become_candidate();
        assert_eq!(state.role, Role::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.leader_hint, None);
    }

    #[test]
    fn become_follower_keeps_vote_within_same_term() {
        let mut state = NodeState::new(&config_3());
        state.become_candidate();
        // Same-term demotion (valid AppendEntries from this term's leader)
        // must not free the vote for reuse.
        state.become_follower(1);
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.voted_for, Some(1));

        state.become_follower(5);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn passive_stays_passive_on_term_advance() {
        let mut config = config_3();
        config.passive = true;
        let mut state = NodeState::new(&config);
        state.become_follower(3);
        assert_eq!(state.role, Role::Passive);
        assert_eq!(state.current_term, 3);
    }

    #[test]
    fn promote_and_demote() {
        let mut config = config_3();
        config.passive = true;
        let mut state = NodeState::new(&config);
        state.promote();
        assert_eq!(state.role, Role::Follower);

        state.demote();
        assert_eq!(state.role, Role::Passive);
    }

    #[test]
    fn majority_of_three_is_two() {
        let state = NodeState::new(&config_3());
        assert_eq!(state.membership.majority(), 2);
        assert_eq!(state.membership.voter_count(), 3);
    }

    #[test]
    fn membership_apply_changes() {
        let mut m = Membership::from_config(&config_3());
        m.apply_change(&TopologyChange::AddNode {
            id: 4,
            passive: true,
        });
        assert!(m.contains(4));
        assert!(!m.is_voter(4));
        assert_eq!(m.majority(), 2);

        m.apply_change(&TopologyChange::PromoteNode { id: 4 });
        assert!(m.is_voter(4));
        assert_eq!(m.majority(), 3);

        m.apply_change(&TopologyChange::RemoveNode { id: 2 });
        assert!(!m.contains(2));
        assert_eq!(m.voter_count(), 3);
    }

    #[test]
    fn membership_peer_views() {
        let mut m = Membership::from_config(&config_3());
        m.apply_change(&TopologyChange::AddNode {
            id: 4,
            passive: true,
        });
        assert_eq!(m.peers_of(1), vec![2, 3, 4]);
        assert_eq!(m.voter_peers_of(1), vec![2, 3]);
    }

    #[test]
    fn log_recency_comparison() {
        let state = NodeState::new(&config_3());
        // Higher last term wins regardless of index.
        assert!(state.log_is_up_to_date(1, 5, 2, 1));
        // Equal term, longer or equal log wins.
        assert!(state.log_is_up_to_date(2, 3, 2, 3));
        assert!(state.log_is_up_to_date(2, 3, 2, 4));
        // Shorter log at equal term loses.
        assert!(!state.log_is_up_to_date(2, 3, 2, 2));
        // Lower last term loses even with a longer log.
        assert!(!state.log_is_up_to_date(2, 3, 1, 10));
    }
}
