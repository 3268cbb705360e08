use std::time::Duration;

/// Unique identifier of a cluster node.
pub type NodeId = u64;

/// A peer node known at startup.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: NodeId,
    /// Passive peers replicate and apply but never vote or campaign.
    pub passive: bool,
}

/// Configuration for a single consensus node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub peers: Vec<PeerConfig>,

    /// Whether this node itself starts as a passive observer.
    pub passive: bool,

    /// Election timeout is drawn uniformly from `[min, max)` per cycle.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat / replication cadence.
    pub heartbeat_interval_ms: u64,

    /// Upper bound on a single RPC round trip.
    pub rpc_timeout_ms: u64,

    /// A submission that has not committed after
    /// `election_timeout_max × operation_timeout_factor` resolves with a
    /// failure instead of hanging on a lost leader.
    pub operation_timeout_factor: u32,

    /// Maximum entries shipped in one AppendEntries batch.
    pub max_append_batch: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            passive: false,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            operation_timeout_factor: 10,
            max_append_batch: 64,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            passive: false,
        });
        self
    }

    pub fn with_passive_peer(mut self, node_id: NodeId) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            passive: true,
        });
        self
    }

    pub fn election_timeout_range(&self) -> (u64, u64) {
        (self.election_timeout_min_ms, self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Deadline after which an uncommitted submission fails.
    pub fn operation_deadline(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms * self.operation_timeout_factor as u64)
    }

    /// How long a resolved idempotency key is retained to answer late
    /// duplicate retries.
    pub fn dedup_retention(&self) -> Duration {
        self.operation_deadline() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert!(cfg.peers.is_empty());
        assert!(!cfg.passive);
        assert_eq!(cfg.election_timeout_min_ms, 150);
        assert_eq!(cfg.election_timeout_max_ms, 300);
        assert_eq!(cfg.heartbeat_interval_ms, 50);
        assert_eq!(cfg.operation_timeout_factor, 10);
    }

    #[test]
    fn node_config_with_peers() {
        let cfg = NodeConfig::new(7).with_peer(2).with_passive_peer(3);
        assert_eq!(cfg.node_id, 7);
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].node_id, 2);
        assert!(!cfg.peers[0].passive);
        assert_eq!(cfg.peers[1].node_id, 3);
        assert!(cfg.peers[1].passive);
    }

    #[test]
    fn operation_deadline_scales_with_election_timeout() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.operation_deadline(), Duration::from_millis(3000));
        assert_eq!(cfg.dedup_retention(), Duration::from_millis(6000));
    }
}
