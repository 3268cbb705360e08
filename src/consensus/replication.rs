use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, NodeId};
use crate::consensus::engine::EngineMessage;
use crate::consensus::rpc::AppendEntriesRequest;
use crate::transport::RaftTransport;

/// Leader-side view of one peer's replication progress.
#[derive(Debug)]
pub(crate) struct FollowerProgress {
    /// Highest index known to match the leader's log.
    pub match_index: u64,
    /// Next index to ship; walked backwards during reconciliation.
    pub next_index: u64,
    /// Last time this peer acknowledged anything.
    pub last_ack: Option<Instant>,
}

impl FollowerProgress {
    fn new(leader_last_index: u64) -> Self {
        Self {
            match_index: 0,
            next_index: leader_last_index + 1,
            last_ack: None,
        }
    }
}

/// One AppendEntries round prepared by the engine for a replicator task.
#[derive(Debug)]
pub(crate) struct ReplicationBatch {
    pub request: AppendEntriesRequest,
    /// More entries remain beyond this batch; skip the heartbeat pause.
    pub more_after: bool,
}

/// Everything the leader role owns: per-peer progress and the replicator
/// tasks feeding it. Dropped in full when leadership ends.
pub(crate) struct LeaderState {
    config: NodeConfig,
    engine_tx: mpsc::Sender<EngineMessage>,
    transport: Arc<dyn RaftTransport>,
    progress: HashMap<NodeId, FollowerProgress>,
    tasks: HashMap<NodeId, JoinHandle<()>>,
    kick: Arc<Notify>,
    cancel: CancellationToken,
}

impl LeaderState {
    pub fn start(
        config: &NodeConfig,
        peers: &[NodeId],
        leader_last_index: u64,
        engine_tx: mpsc::Sender<EngineMessage>,
        transport: Arc<dyn RaftTransport>,
        shutdown: &CancellationToken,
    ) -> Self {
        let mut leader = Self {
            config: config.clone(),
            engine_tx,
            transport,
            progress: HashMap::new(),
            tasks: HashMap::new(),
            kick: Arc::new(Notify::new()),
            cancel: shutdown.child_token(),
        };
        for &peer in peers {
            leader.add_peer(peer, leader_last_index);
        }
        leader
    }

    /// Begin replicating to a peer (new leadership or a committed AddNode).
    pub fn add_peer(&mut self, peer: NodeId, leader_last_index: u64) {
        if self.progress.contains_key(&peer) {
            return;
        }
        self.progress
            .insert(peer, FollowerProgress::new(leader_last_index));
        let task = spawn_replicator(
            peer,
            self.config.clone(),
            self.engine_tx.clone(),
            self.transport.clone(),
            self.kick.clone(),
            self.cancel.clone(),
        );
        self.tasks.insert(peer, task);
        tracing::debug!(peer, "Started replication");
    }

    /// Stop replicating to a removed peer.
    pub fn remove_peer(&mut self, peer: NodeId) {
        self.progress.remove(&peer);
        if let Some(task) = self.tasks.remove(&peer) {
            task.abort();
            tracing::debug!(peer, "Stopped replication");
        }
    }

    pub fn progress(&self, peer: NodeId) -> Option<&FollowerProgress> {
        self.progress.get(&peer)
    }

    pub fn progress_mut(&mut self, peer: NodeId) -> Option<&mut FollowerProgress> {
        self.progress.get_mut(&peer)
    }

    /// Wake every replicator that is waiting out a heartbeat interval.
    pub fn kick(&self) {
        self.kick.notify_waiters();
    }
}

impl Drop for LeaderState {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

async fn fetch_batch(
    engine_tx: &mpsc::Sender<EngineMessage>,
    peer: NodeId,
) -> Option<ReplicationBatch> {
    let (reply, rx) = oneshot::channel();
    engine_tx
        .send(EngineMessage::FetchBatch { peer, reply })
        .await
        .ok()?;
    rx.await.ok()?
}

/// Continuously ships heartbeats and entries to one peer until leadership
/// ends. Transport failures and log-mismatch rejections back off
/// exponentially, capped below the election timeout, and retry forever; a
/// quiet peer never blocks the rest of the cluster.
fn spawn_replicator(
    peer: NodeId,
    config: NodeConfig,
    engine_tx: mpsc::Sender<EngineMessage>,
    transport: Arc<dyn RaftTransport>,
    kick: Arc<Notify>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let heartbeat = config.heartbeat_interval();
        let backoff_cap = std::time::Duration::from_millis(config.election_timeout_min_ms);
        let mut backoff = heartbeat;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            // The engine serializes all state access; this task only ferries.
            let Some(ReplicationBatch {
                request,
                more_after,
            }) = fetch_batch(&engine_tx, peer).await
            else {
                return;
            };
            let sent_up_to = request.prev_log_index + request.entries.len() as u64;

            match tokio::time::timeout(config.rpc_timeout(), transport.append_entries(peer, request))
                .await
            {
                Ok(Ok(resp)) => {
                    let accepted = resp.success;
                    if engine_tx
                        .send(EngineMessage::PeerResult {
                            peer,
                            sent_up_to,
                            resp,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    if accepted {
                        backoff = heartbeat;
                        if more_after {
                            continue;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = kick.notified() => {}
                            _ = tokio::time::sleep(heartbeat) => {}
                        }
                    } else {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(backoff_cap);
                    }
                }
                Ok(Err(err)) => {
                    tracing::trace!(peer, error = %err, "AppendEntries send failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(backoff_cap);
                }
                Err(_) => {
                    tracing::trace!(peer, "AppendEntries timed out");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(backoff_cap);
                }
            }
        }
    })
}
