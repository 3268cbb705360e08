use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::NodeId;
use crate::consensus::engine::ConsensusHandle;
use crate::consensus::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};

/// Transport-level failure. Never surfaced to protocol logic as an error;
/// the election and replication paths absorb it with retry.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request to peer {0} timed out")]
    Timeout(NodeId),
}

/// Carries consensus RPCs between nodes. Implementations are best-effort:
/// drops and timeouts are expected, callers retry.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn append_entries(
        &self,
        peer: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}

#[derive(Default)]
struct RouterInner {
    nodes: Mutex<HashMap<NodeId, ConsensusHandle>>,
    /// Directed links currently dropped, as (from, to) pairs.
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
}

/// In-process message router connecting a set of engines.
///
/// Supports dropping individual directed links, which is how the tests and
/// the demo binary simulate partitions and leader isolation.
#[derive(Clone, Default)]
pub struct MemoryRouter {
    inner: Arc<RouterInner>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, handle: ConsensusHandle) {
        self.inner.nodes.lock().expect("router lock").insert(id, handle);
    }

    pub fn deregister(&self, id: NodeId) {
        self.inner.nodes.lock().expect("router lock").remove(&id);
    }

    /// The transport endpoint a node uses to reach its peers.
    pub fn transport_for(&self, from: NodeId) -> MemoryTransport {
        MemoryTransport {
            router: self.clone(),
            from,
        }
    }

    /// Drop the directed link `from -> to`.
    pub fn disconnect(&self, from: NodeId, to: NodeId) {
        self.inner
            .blocked
            .lock()
            .expect("router lock")
            .insert((from, to));
    }

    /// Restore the directed link `from -> to`.
    pub fn reconnect(&self, from: NodeId, to: NodeId) {
        self.inner
            .blocked
            .lock()
            .expect("router lock")
            .remove(&(from, to));
    }

    /// Cut every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        let others: Vec<NodeId> = {
            let nodes = self.inner.nodes.lock().expect("router lock");
            nodes.keys().copied().filter(|&n| n != id).collect()
        };
        let mut blocked = self.inner.blocked.lock().expect("router lock");
        for other in others {
            blocked.insert((id, other));
            blocked.insert((other, id));
        }
    }

    /// Restore every link to and from `id`.
    pub fn heal(&self, id: NodeId) {
        self.inner
            .blocked
            .lock()
            .expect("router lock")
            .retain(|&(from, to)| from != id && to != id);
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<ConsensusHandle> {
        if self
            .inner
            .blocked
            .lock()
            .expect("router lock")
            .contains(&(from, to))
        {
            return None;
        }
        self.inner.nodes.lock().expect("router lock").get(&to).cloned()
    }
}

/// One node's endpoint into a `MemoryRouter`.
pub struct MemoryTransport {
    router: MemoryRouter,
    from: NodeId,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn request_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let handle = self
            .router
            .route(self.from, peer)
            .ok_or(TransportError::Unreachable(peer))?;
        // The reply must travel an unblocked reverse link too.
        let resp = handle
            .handle_request_vote(req)
            .await
            .map_err(|_| TransportError::Unreachable(peer))?;
        if self.router.route(peer, self.from).is_none() {
            return Err(TransportError::Unreachable(peer));
        }
        Ok(resp)
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let handle = self
            .router
            .route(self.from, peer)
            .ok_or(TransportError::Unreachable(peer))?;
        let resp = handle
            .handle_append_entries(req)
            .await
            .map_err(|_| TransportError::Unreachable(peer))?;
        if self.router.route(peer, self.from).is_none() {
            return Err(TransportError::Unreachable(peer));
        }
        Ok(resp)
    }
}
