use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::consensus::engine::{ConsensusEngine, ConsensusHandle};
use crate::error::Result;
use crate::storage::{PersistentLog, StateMachine};
use crate::transport::RaftTransport;

/// One consensus node: the engine task plus the seams it is wired to.
///
/// Construction recovers the durable log; a corrupt log fails startup and
/// the node must not rejoin the voting set until repaired.
pub struct Node {
    pub config: NodeConfig,
    handle: ConsensusHandle,
    shutdown: CancellationToken,
    engine_task: JoinHandle<()>,
}

impl Node {
    /// Recover storage, spawn the engine, and return the running node.
    pub fn start(
        config: NodeConfig,
        storage: Box<dyn PersistentLog>,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let (engine, handle) = ConsensusEngine::new(
            config.clone(),
            storage,
            machine,
            transport,
            shutdown.clone(),
        )?;

        tracing::info!(node_id = config.node_id, "Starting consensus node");
        let engine_task = tokio::spawn(engine.run());

        Ok(Self {
            config,
            handle,
            shutdown,
            engine_task,
        })
    }

    /// Client surface of this node's engine.
    pub fn handle(&self) -> ConsensusHandle {
        self.handle.clone()
    }

    /// Stop the engine and wait for it to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.engine_task.await;
        tracing::info!(node_id = self.config.node_id, "Node stopped");
    }

    /// Stop the engine without waiting (crash-style stop in tests).
    pub fn abort(self) {
        self.shutdown.cancel();
        self.engine_task.abort();
    }
}
