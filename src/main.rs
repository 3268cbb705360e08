use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use concord::command::{Command, TopologyChange};
use concord::config::{NodeConfig, NodeId};
use concord::consensus::engine::{CommitIndexModification, ConsensusHandle};
use concord::consensus::state::Role;
use concord::node::Node;
use concord::shutdown::install_shutdown_handler;
use concord::storage::{CountingStateMachine, InMemoryLog};
use concord::transport::MemoryRouter;

#[derive(Parser, Debug)]
#[command(name = "concord")]
#[command(version)]
#[command(about = "A Raft-based consensus engine for replicated cluster commands")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process demo cluster and replicate a batch of commands
    Demo(DemoArgs),
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of voting nodes
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of commands to replicate
    #[arg(long, default_value = "10")]
    commands: u64,

    /// Also run a passive observer and promote it at the end
    #[arg(long)]
    passive: bool,

    /// Election timeout lower bound in milliseconds
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Election timeout upper bound in milliseconds
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Demo(demo) => run_demo(demo).await,
    }
}

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let router = MemoryRouter::new();

    let voter_ids: Vec<NodeId> = (1..=args.nodes).collect();
    let passive_id = args.passive.then_some(args.nodes + 1);
    let all_ids: Vec<NodeId> = voter_ids
        .iter()
        .copied()
        .chain(passive_id.into_iter())
        .collect();

    let mut nodes = Vec::new();
    for &id in &all_ids {
        let mut config = NodeConfig::new(id);
        config.election_timeout_min_ms = args.election_timeout_min_ms;
        config.election_timeout_max_ms = args.election_timeout_max_ms;
        config.heartbeat_interval_ms = args.heartbeat_interval_ms;
        config.passive = Some(id) == passive_id;
        for &peer in &all_ids {
            if peer != id {
                config.peers.push(concord::config::PeerConfig {
                    node_id: peer,
                    passive: Some(peer) == passive_id,
                });
            }
        }

        let node = Node::start(
            config,
            Box::new(InMemoryLog::new()),
            Box::new(CountingStateMachine::new()),
            Arc::new(router.transport_for(id)),
        )?;
        router.register(id, node.handle());
        nodes.push(node);
    }

    let handles: Vec<ConsensusHandle> = nodes.iter().map(|n| n.handle()).collect();
    let leader = wait_for_leader(&handles, Duration::from_secs(10))
        .await
        .ok_or("no leader elected within 10s")?;
    let (_, term) = leader.role_and_term();
    tracing::info!(term, "Cluster elected a leader");

    for i in 0..args.commands {
        let applied = leader
            .submit(Command::UpdateValue {
                key: "demo".to_string(),
                delta: 1,
            })
            .await?;
        tracing::info!(index = applied.index, value = %applied.value, command = i, "Committed");
    }

    // Every node observes the full commit.
    let last_index = leader.last_entry_index();
    for handle in &handles {
        handle
            .wait_for_commit_index_change(CommitIndexModification::GreaterOrEqual, last_index)
            .await?;
    }
    tracing::info!(last_index, "All nodes caught up");

    if let Some(id) = passive_id {
        leader
            .submit(Command::Reconfigure(TopologyChange::PromoteNode { id }))
            .await?;
        tracing::info!(node_id = id, "Promoted passive observer to voter");
    }

    for handle in &handles {
        let status = handle.status();
        tracing::info!(
            node_id = status.node_id,
            role = %status.role,
            term = status.term,
            commit_index = status.commit_index,
            "Final state"
        );
    }

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
    }
    for node in nodes {
        node.shutdown().await;
    }
    Ok(())
}

async fn wait_for_leader(
    handles: &[ConsensusHandle],
    timeout: Duration,
) -> Option<ConsensusHandle> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(leader) = handles
            .iter()
            .find(|h| h.role_and_term().0 == Role::Leader)
        {
            return Some(leader.clone());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}
