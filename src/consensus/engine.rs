use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, RaftId, TopologyChange};
use crate::config::{NodeConfig, NodeId};
use crate::consensus::commit::majority_match_index;
use crate::consensus::dedup::{DedupState, Deduplicator};
use crate::consensus::log::LogStore;
use crate::consensus::replication::{LeaderState, ReplicationBatch};
use crate::consensus::rpc::{
    self, AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use crate::consensus::state::{NodeState, Role};
use crate::consensus::timer::random_election_timeout;
use crate::error::{ConsensusError, Result};
use crate::storage::{Applied, PersistentLog, StateMachine};
use crate::transport::RaftTransport;

/// How a commit watcher compares the commit index against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitIndexModification {
    GreaterOrEqual,
    Exact,
}

/// Read-only snapshot of engine state, published after every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub commit_index: u64,
    pub last_index: u64,
    pub last_applied: u64,
    pub leader_hint: Option<NodeId>,
}

/// Messages into the engine's serialized command queue. All state mutation
/// funnels through here; nothing else touches live state.
pub(crate) enum EngineMessage {
    Submit {
        command: Command,
        id: RaftId,
        reply: oneshot::Sender<Result<Applied>>,
    },
    StepDown {
        reply: oneshot::Sender<()>,
    },
    WaitForCommit {
        mode: CommitIndexModification,
        index: u64,
        notify: oneshot::Sender<()>,
    },
    LogSummary {
        reply: oneshot::Sender<Vec<(u64, u64)>>,
    },
    RequestVote {
        req: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    VoteReply {
        campaign_term: u64,
        from: NodeId,
        resp: VoteResponse,
    },
    FetchBatch {
        peer: NodeId,
        reply: oneshot::Sender<Option<ReplicationBatch>>,
    },
    PeerResult {
        peer: NodeId,
        sent_up_to: u64,
        resp: AppendEntriesResponse,
    },
}

/// A submission waiting for its log index to commit and apply. Duplicate
/// submissions of the same idempotency key attach additional waiters; all
/// of them resolve with the same outcome, exactly once.
struct PendingSubmission {
    id: RaftId,
    deadline: Instant,
    waiters: Vec<oneshot::Sender<Result<Applied>>>,
}

struct CommitWatcher {
    index: u64,
    mode: CommitIndexModification,
    notify: oneshot::Sender<()>,
}

fn watcher_satisfied(mode: CommitIndexModification, index: u64, commit_index: u64) -> bool {
    match mode {
        CommitIndexModification::GreaterOrEqual => commit_index >= index,
        CommitIndexModification::Exact => commit_index == index,
    }
}

/// An in-flight election round.
struct Campaign {
    term: u64,
    votes: HashSet<NodeId>,
}

/// Cloneable client surface of a consensus engine.
#[derive(Clone)]
pub struct ConsensusHandle {
    tx: mpsc::Sender<EngineMessage>,
    status_rx: watch::Receiver<EngineStatus>,
}

impl ConsensusHandle {
    /// Submit a command with a fresh idempotency key.
    pub async fn submit(&self, command: Command) -> Result<Applied> {
        self.submit_with_id(command, RaftId::new()).await
    }

    /// Submit a command under a caller-supplied idempotency key. Retrying
    /// with the same key attaches to the original submission instead of
    /// appending a second entry.
    ///
    /// Dropping the returned future detaches the caller; the entry itself
    /// continues toward commit.
    pub async fn submit_with_id(&self, command: Command, id: RaftId) -> Result<Applied> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::Submit { command, id, reply })
            .await
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)?
    }

    /// Relinquish leadership. Submissions not yet majority-committed fail
    /// with `NotLeading`.
    pub async fn step_down(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::StepDown { reply })
            .await
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    /// Resolve once the commit index satisfies `mode` relative to `index`.
    /// One-shot: fires the first time the condition holds.
    pub async fn wait_for_commit_index_change(
        &self,
        mode: CommitIndexModification,
        index: u64,
    ) -> Result<()> {
        let (notify, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::WaitForCommit {
                mode,
                index,
                notify,
            })
            .await
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    /// `(index, term)` pairs of the whole local log, for diagnostics.
    pub async fn log_summary(&self) -> Result<Vec<(u64, u64)>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::LogSummary { reply })
            .await
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    /// Inbound RequestVote from the transport layer.
    pub async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::RequestVote { req, reply })
            .await
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    /// Inbound AppendEntries from the transport layer.
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::AppendEntries { req, reply })
            .await
            .map_err(|_| ConsensusError::Shutdown)?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    pub fn status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    pub fn role_and_term(&self) -> (Role, u64) {
        let status = self.status_rx.borrow();
        (status.role, status.term)
    }

    pub fn last_entry_index(&self) -> u64 {
        self.status_rx.borrow().last_index
    }

    pub fn commit_index(&self) -> u64 {
        self.status_rx.borrow().commit_index
    }

    pub fn is_leader(&self) -> bool {
        self.status_rx.borrow().role == Role::Leader
    }
}

/// The consensus state machine: a single-writer actor owning term, vote,
/// role, log tail, dedup table, pending submissions, and commit watchers.
///
/// The election timer lives in the actor's select loop; the replication
/// dispatcher and campaign tasks are spawned helpers that talk back only
/// through the message queue.
pub struct ConsensusEngine {
    config: NodeConfig,
    state: NodeState,
    log: LogStore,
    machine: Box<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    dedup: Deduplicator,
    pending: BTreeMap<u64, PendingSubmission>,
    watchers: Vec<CommitWatcher>,
    campaign: Option<Campaign>,
    leader: Option<LeaderState>,
    rx: mpsc::Receiver<EngineMessage>,
    self_tx: mpsc::Sender<EngineMessage>,
    status_tx: watch::Sender<EngineStatus>,
    election_deadline: Instant,
    shutdown: CancellationToken,
}

impl ConsensusEngine {
    /// Recover the durable log and assemble the engine. Fails with
    /// `CorruptLog` if the persisted log violates its shape invariants; a
    /// node in that condition must not rejoin the voting set.
    pub fn new(
        config: NodeConfig,
        storage: Box<dyn PersistentLog>,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        shutdown: CancellationToken,
    ) -> Result<(Self, ConsensusHandle)> {
        let log = LogStore::recover(storage)?;
        let state = NodeState::new(&config);

        let (self_tx, rx) = mpsc::channel(128);
        let (status_tx, status_rx) = watch::channel(EngineStatus {
            node_id: state.id,
            role: state.role,
            term: state.current_term,
            commit_index: state.commit_index,
            last_index: log.last_index(),
            last_applied: state.last_applied,
            leader_hint: None,
        });

        let (min, max) = config.election_timeout_range();
        let dedup = Deduplicator::new(config.dedup_retention());
        let engine = Self {
            state,
            log,
            machine,
            transport,
            dedup,
            pending: BTreeMap::new(),
            watchers: Vec::new(),
            campaign: None,
            leader: None,
            rx,
            self_tx: self_tx.clone(),
            status_tx,
            election_deadline: Instant::now() + random_election_timeout(min, max),
            shutdown,
            config,
        };
        let handle = ConsensusHandle {
            tx: self_tx,
            status_rx,
        };
        Ok((engine, handle))
    }

    /// Run the engine until shutdown. All state transitions happen on this
    /// task.
    pub async fn run(mut self) {
        let mut maintenance = tokio::time::interval(self.config.heartbeat_interval());
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(msg) = self.rx.recv() => {
                    self.handle_message(msg);
                }

                _ = tokio::time::sleep_until(self.election_deadline) => {
                    self.on_election_timeout();
                }

                _ = maintenance.tick() => {
                    self.on_maintenance_tick();
                }
            }
        }

        self.leader = None;
        for (_, submission) in std::mem::take(&mut self.pending) {
            for waiter in submission.waiters {
                let _ = waiter.send(Err(ConsensusError::Shutdown));
            }
        }
        tracing::info!(node_id = self.state.id, "Consensus engine stopped");
    }

    fn handle_message(&mut self, msg: EngineMessage) {
        match msg {
            EngineMessage::Submit { command, id, reply } => self.on_submit(command, id, reply),
            EngineMessage::StepDown { reply } => self.on_step_down(reply),
            EngineMessage::WaitForCommit {
                mode,
                index,
                notify,
            } => self.on_wait_for_commit(mode, index, notify),
            EngineMessage::LogSummary { reply } => {
                let _ = reply.send(self.log.summary());
            }
            EngineMessage::RequestVote { req, reply } => self.on_request_vote(req, reply),
            EngineMessage::AppendEntries { req, reply } => self.on_append_entries(req, reply),
            EngineMessage::VoteReply {
                campaign_term,
                from,
                resp,
            } => self.on_vote_reply(campaign_term, from, resp),
            EngineMessage::FetchBatch { peer, reply } => {
                let _ = reply.send(self.build_batch(peer));
            }
            EngineMessage::PeerResult {
                peer,
                sent_up_to,
                resp,
            } => self.on_peer_result(peer, sent_up_to, resp),
        }
    }

    // ---- client operations ----

    fn on_submit(&mut self, command: Command, id: RaftId, reply: oneshot::Sender<Result<Applied>>) {
        if !self.state.is_leader() {
            let _ = reply.send(Err(ConsensusError::NotLeading {
                leader_hint: self.state.leader_hint,
            }));
            return;
        }

        match self.dedup.lookup(&id) {
            Some(DedupState::Applied { outcome, .. }) => {
                let _ = reply.send(Ok(outcome.clone()));
            }
            Some(DedupState::Pending { index }) => {
                let index = *index;
                if let Some(submission) = self.pending.get_mut(&index) {
                    submission.waiters.push(reply);
                } else {
                    let _ = reply.send(Err(ConsensusError::Timeout));
                }
            }
            None => {
                let term = self.state.current_term;
                let index = self.log.append_leader(term, command, id);
                self.dedup.register_pending(id, index);
                self.pending.insert(
                    index,
                    PendingSubmission {
                        id,
                        deadline: Instant::now() + self.config.operation_deadline(),
                        waiters: vec![reply],
                    },
                );
                tracing::debug!(node_id = self.state.id, index, term, "Appended command");
                if let Some(leader) = &self.leader {
                    leader.kick();
                }
                self.maybe_advance_commit();
                self.publish();
            }
        }
    }

    fn on_step_down(&mut self, reply: oneshot::Sender<()>) {
        if self.state.is_leader() {
            tracing::info!(
                node_id = self.state.id,
                term = self.state.current_term,
                "Stepping down on request"
            );
            self.state.leader_hint = None;
            self.state.become_follower(self.state.current_term);
            self.on_leadership_lost();
            self.reset_election_timer();
            self.publish();
        }
        let _ = reply.send(());
    }

    fn on_wait_for_commit(
        &mut self,
        mode: CommitIndexModification,
        index: u64,
        notify: oneshot::Sender<()>,
    ) {
        if watcher_satisfied(mode, index, self.state.commit_index) {
            let _ = notify.send(());
            return;
        }
        self.watchers.push(CommitWatcher {
            index,
            mode,
            notify,
        });
    }

    // ---- inbound RPCs ----

    fn on_request_vote(&mut self, req: VoteRequest, reply: oneshot::Sender<VoteResponse>) {
        let was_leader = self.state.is_leader();
        let resp = rpc::handle_request_vote(&mut self.state, &self.log, &req);
        if was_leader && !self.state.is_leader() {
            self.on_leadership_lost();
        }
        if self.state.role != Role::Candidate {
            self.campaign = None;
        }
        if resp.vote_granted {
            self.reset_election_timer();
        }
        let _ = reply.send(resp);
        self.publish();
    }

    fn on_append_entries(
        &mut self,
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    ) {
        let was_leader = self.state.is_leader();
        let req_term = req.term;
        let resp = rpc::handle_append_entries(&mut self.state, &mut self.log, req);
        if was_leader && !self.state.is_leader() {
            self.on_leadership_lost();
        }
        if self.state.role != Role::Candidate {
            self.campaign = None;
        }
        if req_term == self.state.current_term {
            // Valid contact from this term's leader.
            self.reset_election_timer();
        }
        let _ = reply.send(resp);
        self.apply_committed();
        self.publish();
    }

    // ---- elections ----

    fn on_election_timeout(&mut self) {
        self.reset_election_timer();
        if !self.state.can_campaign() {
            return;
        }
        self.start_campaign();
    }

    fn start_campaign(&mut self) {
        self.state.become_candidate();
        let term = self.state.current_term;
        tracing::info!(
            node_id = self.state.id,
            term,
            "Election timeout, starting election"
        );

        let mut votes = HashSet::new();
        votes.insert(self.state.id);
        self.campaign = Some(Campaign { term, votes });

        if self.campaign_won() {
            self.become_leader();
            self.publish();
            return;
        }

        let req = VoteRequest {
            term,
            candidate_id: self.state.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.state.membership.voter_peers_of(self.state.id) {
            let transport = self.transport.clone();
            let engine_tx = self.self_tx.clone();
            let req = req.clone();
            let rpc_timeout = self.config.rpc_timeout();
            tokio::spawn(async move {
                match tokio::time::timeout(rpc_timeout, transport.request_vote(peer, req)).await {
                    Ok(Ok(resp)) => {
                        let _ = engine_tx
                            .send(EngineMessage::VoteReply {
                                campaign_term: term,
                                from: peer,
                                resp,
                            })
                            .await;
                    }
                    Ok(Err(err)) => {
                        tracing::trace!(peer, error = %err, "Vote request failed");
                    }
                    Err(_) => {
                        tracing::trace!(peer, "Vote request timed out");
                    }
                }
            });
        }
        self.publish();
    }

    fn on_vote_reply(&mut self, campaign_term: u64, from: NodeId, resp: VoteResponse) {
        if resp.term > self.state.current_term {
            self.observe_higher_term(resp.term);
            return;
        }
        if self.state.role != Role::Candidate || self.state.current_term != campaign_term {
            return;
        }
        if !resp.vote_granted {
            return;
        }

        if let Some(campaign) = self.campaign.as_mut() {
            campaign.votes.insert(from);
            tracing::debug!(
                node_id = self.state.id,
                from,
                votes = campaign.votes.len(),
                "Received vote"
            );
        }
        if self.campaign_won() {
            self.become_leader();
            self.publish();
        }
    }

    fn campaign_won(&self) -> bool {
        self.campaign
            .as_ref()
            .map(|c| c.votes.len() >= self.state.membership.majority())
            .unwrap_or(false)
    }

    fn become_leader(&mut self) {
        self.state.become_leader();
        self.campaign = None;
        tracing::info!(
            node_id = self.state.id,
            term = self.state.current_term,
            "Became leader"
        );

        let peers = self.state.membership.peers_of(self.state.id);
        self.leader = Some(LeaderState::start(
            &self.config,
            &peers,
            self.log.last_index(),
            self.self_tx.clone(),
            self.transport.clone(),
            &self.shutdown,
        ));

        // Anchor the new term: commit can only advance over a current-term
        // entry, so give the term one immediately.
        self.log
            .append_leader(self.state.current_term, Command::Noop, RaftId::new());
        if let Some(leader) = &self.leader {
            leader.kick();
        }
        self.maybe_advance_commit();
    }

    fn observe_higher_term(&mut self, term: u64) {
        let was_leader = self.state.is_leader();
        self.state.become_follower(term);
        self.campaign = None;
        if was_leader {
            self.on_leadership_lost();
        }
        self.publish();
    }

    /// Leadership ended before every pending submission committed: the
    /// replication dispatcher is torn down and the remaining submissions
    /// fail with `NotLeading`.
    fn on_leadership_lost(&mut self) {
        self.leader = None;
        let hint = self.state.leader_hint;
        for (_, submission) in std::mem::take(&mut self.pending) {
            self.dedup.forget(&submission.id);
            for waiter in submission.waiters {
                let _ = waiter.send(Err(ConsensusError::NotLeading { leader_hint: hint }));
            }
        }
        tracing::info!(
            node_id = self.state.id,
            term = self.state.current_term,
            "No longer leading"
        );
    }

    // ---- replication and commit ----

    fn build_batch(&self, peer: NodeId) -> Option<ReplicationBatch> {
        if !self.state.is_leader() {
            return None;
        }
        let progress = self.leader.as_ref()?.progress(peer)?;
        let next = progress.next_index.max(1);
        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.log.term_at(prev_log_index).unwrap_or(0)
        };
        let entries = self.log.entries_from(next, self.config.max_append_batch);
        let sent_up_to = prev_log_index + entries.len() as u64;

        Some(ReplicationBatch {
            request: AppendEntriesRequest {
                term: self.state.current_term,
                leader_id: self.state.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.state.commit_index,
            },
            more_after: self.log.last_index() > sent_up_to,
        })
    }

    fn on_peer_result(&mut self, peer: NodeId, sent_up_to: u64, resp: AppendEntriesResponse) {
        if resp.term > self.state.current_term {
            self.observe_higher_term(resp.term);
            return;
        }
        if !self.state.is_leader() {
            return;
        }
        let Some(progress) = self.leader.as_mut().and_then(|l| l.progress_mut(peer)) else {
            return;
        };
        progress.last_ack = Some(Instant::now());

        if resp.success {
            if sent_up_to > progress.match_index {
                progress.match_index = sent_up_to;
            }
            progress.next_index = progress.match_index + 1;
            self.maybe_advance_commit();
            self.publish();
        } else {
            // Standard backward reconciliation, accelerated by the
            // follower's match hint.
            let hinted = resp.match_index.saturating_add(1);
            let backed = progress.next_index.saturating_sub(1).max(1);
            progress.next_index = backed.min(hinted).max(1);
            tracing::debug!(
                peer,
                next_index = progress.next_index,
                "Peer rejected entries, backing up"
            );
        }
    }

    fn maybe_advance_commit(&mut self) {
        if !self.state.is_leader() {
            return;
        }
        let peer_matches: Vec<u64> = self
            .state
            .membership
            .voter_peers_of(self.state.id)
            .into_iter()
            .map(|peer| {
                self.leader
                    .as_ref()
                    .and_then(|l| l.progress(peer))
                    .map(|p| p.match_index)
                    .unwrap_or(0)
            })
            .collect();
        let candidate = majority_match_index(
            &peer_matches,
            self.log.last_index(),
            self.state.membership.voter_count(),
        );

        // Only entries of the current term commit by counting replicas.
        if candidate > self.state.commit_index
            && self.log.term_at(candidate) == Some(self.state.current_term)
        {
            self.state.commit_index = candidate;
            self.log.set_commit_floor(candidate);
            tracing::debug!(
                node_id = self.state.id,
                commit_index = candidate,
                "Commit index advanced"
            );
            self.apply_committed();
        }
    }

    /// Feed newly committed entries to the state machine in index order,
    /// resolve their submissions, then fire satisfied watchers.
    fn apply_committed(&mut self) {
        let now = Instant::now();
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let Some(entry) = self.log.entry_at(index).cloned() else {
                break;
            };

            if let Command::Reconfigure(change) = &entry.command {
                self.apply_topology(change.clone());
            }
            let value = self.machine.apply(&entry);
            self.state.last_applied = index;

            let applied = Applied {
                index,
                term: entry.term,
                value,
            };
            self.dedup.mark_applied(entry.id, applied.clone(), now);
            if let Some(submission) = self.pending.remove(&index) {
                for waiter in submission.waiters {
                    let _ = waiter.send(Ok(applied.clone()));
                }
            }
            tracing::trace!(node_id = self.state.id, index, "Applied committed entry");
        }
        self.resolve_watchers();
    }

    fn resolve_watchers(&mut self) {
        let commit_index = self.state.commit_index;
        let watchers = std::mem::take(&mut self.watchers);
        for watcher in watchers {
            if watcher_satisfied(watcher.mode, watcher.index, commit_index) {
                let _ = watcher.notify.send(());
            } else {
                self.watchers.push(watcher);
            }
        }
    }

    fn apply_topology(&mut self, change: TopologyChange) {
        self.state.membership.apply_change(&change);
        tracing::info!(node_id = self.state.id, ?change, "Applied topology change");

        match change {
            TopologyChange::AddNode { id, .. } => {
                if id != self.state.id {
                    let last_index = self.log.last_index();
                    if let Some(leader) = self.leader.as_mut() {
                        leader.add_peer(id, last_index);
                    }
                }
            }
            TopologyChange::RemoveNode { id } => {
                if id == self.state.id {
                    let was_leader = self.state.is_leader();
                    self.state.leader_hint = None;
                    self.state.demote();
                    if was_leader {
                        self.on_leadership_lost();
                    }
                } else if let Some(leader) = self.leader.as_mut() {
                    leader.remove_peer(id);
                }
            }
            TopologyChange::PromoteNode { id } => {
                if id == self.state.id {
                    self.state.promote();
                    self.reset_election_timer();
                }
            }
        }
    }

    // ---- housekeeping ----

    fn on_maintenance_tick(&mut self) {
        let now = Instant::now();
        self.fail_expired_submissions(now);
        self.dedup.sweep(now);
        if self.state.is_leader() {
            // Covers commit advances driven by membership shrink.
            self.maybe_advance_commit();
        }
    }

    fn fail_expired_submissions(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, s)| now >= s.deadline)
            .map(|(index, _)| *index)
            .collect();
        if expired.is_empty() {
            return;
        }

        let err = if self.state.is_leader() {
            ConsensusError::Timeout
        } else {
            ConsensusError::NotLeading {
                leader_hint: self.state.leader_hint,
            }
        };
        for index in expired {
            if let Some(submission) = self.pending.remove(&index) {
                self.dedup.forget(&submission.id);
                tracing::warn!(
                    node_id = self.state.id,
                    index,
                    "Submission expired before commit"
                );
                for waiter in submission.waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    fn reset_election_timer(&mut self) {
        let (min, max) = self.config.election_timeout_range();
        self.election_deadline = Instant::now() + random_election_timeout(min, max);
    }

    fn publish(&self) {
        self.status_tx.send_replace(EngineStatus {
            node_id: self.state.id,
            role: self.state.role,
            term: self.state.current_term,
            commit_index: self.state.commit_index,
            last_index: self.log.last_index(),
            last_applied: self.state.last_applied,
            leader_hint: self.state.leader_hint,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CountingStateMachine, InMemoryLog};
    use crate::transport::MemoryRouter;
    use std::time::Duration;

    fn fast_config(node_id: NodeId) -> NodeConfig {
        NodeConfig {
            node_id,
            election_timeout_min_ms: 20,
            election_timeout_max_ms: 40,
            heartbeat_interval_ms: 10,
            rpc_timeout_ms: 50,
            ..Default::default()
        }
    }

    fn spawn_single(config: NodeConfig) -> (ConsensusHandle, CancellationToken) {
        let router = MemoryRouter::new();
        let transport = Arc::new(router.transport_for(config.node_id));
        let shutdown = CancellationToken::new();
        let (engine, handle) = ConsensusEngine::new(
            config,
            Box::new(InMemoryLog::new()),
            Box::new(CountingStateMachine::new()),
            transport,
            shutdown.clone(),
        )
        .unwrap();
        tokio::spawn(engine.run());
        (handle, shutdown)
    }

    async fn wait_for_leadership(handle: &ConsensusHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_leader() {
            assert!(Instant::now() < deadline, "node never became leader");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn update(key: &str, delta: i64) -> Command {
        Command::UpdateValue {
            key: key.to_string(),
            delta,
        }
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let (handle, shutdown) = spawn_single(fast_config(1));
        wait_for_leadership(&handle).await;

        let applied = handle.submit(update("x", 5)).await.unwrap();
        assert_eq!(applied.value, serde_json::json!(5));
        // Index 1 is the leader's term anchor.
        assert_eq!(applied.index, 2);

        let status = handle.status();
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.last_applied, 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn duplicate_submission_returns_recorded_outcome() {
        let (handle, shutdown) = spawn_single(fast_config(1));
        wait_for_leadership(&handle).await;

        let id = RaftId::new();
        let first = handle.submit_with_id(update("k", 3), id).await.unwrap();
        let second = handle.submit_with_id(update("k", 3), id).await.unwrap();
        assert_eq!(first, second);

        // A distinct key appends a distinct entry.
        let third = handle.submit(update("k", 3)).await.unwrap();
        assert_eq!(third.index, first.index + 1);
        assert_eq!(third.value, serde_json::json!(6));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn submit_on_non_leader_fails_fast() {
        let mut config = fast_config(1);
        // With voting peers that do not exist, this node never wins.
        config = config.with_peer(2).with_peer(3);
        let (handle, shutdown) = spawn_single(config);

        let err = handle.submit(update("x", 1)).await.unwrap_err();
        assert!(matches!(err, ConsensusError::NotLeading { .. }));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn step_down_relinquishes_leadership() {
        let (handle, shutdown) = spawn_single(fast_config(1));
        wait_for_leadership(&handle).await;

        handle.step_down().await.unwrap();
        let (role, _) = handle.role_and_term();
        assert_ne!(role, Role::Leader);
        // A single-node cluster re-elects itself shortly after.
        wait_for_leadership(&handle).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn commit_watcher_modes() {
        let (handle, shutdown) = spawn_single(fast_config(1));
        wait_for_leadership(&handle).await;

        let applied = handle.submit(update("w", 1)).await.unwrap();

        // Already satisfied: resolves immediately.
        handle
            .wait_for_commit_index_change(CommitIndexModification::GreaterOrEqual, applied.index)
            .await
            .unwrap();

        // Not yet satisfied: resolves when the next entry commits.
        let watcher = {
            let handle = handle.clone();
            let target = applied.index + 1;
            tokio::spawn(async move {
                handle
                    .wait_for_commit_index_change(CommitIndexModification::Exact, target)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.submit(update("w", 1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .expect("watcher did not fire")
            .unwrap()
            .unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn passive_node_never_campaigns() {
        let mut config = fast_config(1);
        config.passive = true;
        let (handle, shutdown) = spawn_single(config);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = handle.status();
        assert_eq!(status.role, Role::Passive);
        assert_eq!(status.term, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn corrupt_log_refuses_startup() {
        use crate::storage::LogEntry;
        let seeded = InMemoryLog::seeded(vec![
            LogEntry {
                index: 1,
                term: 1,
                command: Command::Noop,
                id: RaftId::new(),
            },
            LogEntry {
                index: 3,
                term: 1,
                command: Command::Noop,
                id: RaftId::new(),
            },
        ]);
        let router = MemoryRouter::new();
        let err = ConsensusEngine::new(
            fast_config(1),
            Box::new(seeded),
            Box::new(CountingStateMachine::new()),
            Arc::new(router.transport_for(1)),
            CancellationToken::new(),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, ConsensusError::CorruptLog(_)));
    }
}
