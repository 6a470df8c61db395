//! Simulated swarm walkthrough: consensus, Raft, gossip and sync over an
//! in-process network.
//!
//! Usage: `swarm-coordination [agents] [--json | --verbose]`. Configuration comes from
//! `SWARM_*` environment variables (a `.env` file is honoured).

use serde_json::json;
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use swarm_coordination::config::SwarmConfig;
use swarm_coordination::consensus::algorithms::raft::Role;
use swarm_coordination::consensus::{voter_handler, Algorithm, ConsensusManager, Proposal, VoteChoice};
use swarm_coordination::gossip::{GossipNode, GossipProtocol};
use swarm_coordination::logger;
use swarm_coordination::network::sim::SimulatedNetwork;
use swarm_coordination::network::Channel;
use swarm_coordination::state::{ConflictResolver, Payload};
use swarm_coordination::storage::{MemoryStorage, SqliteStorage, Storage};
use swarm_coordination::synchronizer::{SnapshotListener, StateSynchronizer};
use swarm_coordination::{Agent, RaftConsensus};
use tokio::time::Instant;
use tracing::{info, warn};

fn open_storage(config: &SwarmConfig) -> Result<Arc<dyn Storage>, Box<dyn Error>> {
    let storage: Arc<dyn Storage> = match &config.storage_path {
        Some(path) => Arc::new(SqliteStorage::open(path)?),
        None => Arc::new(MemoryStorage::new()),
    };
    Ok(storage)
}

async fn run_votes(
    network: &SimulatedNetwork,
    ids: &[String],
    config: &SwarmConfig,
) -> Result<(), Box<dyn Error>> {
    // Agents vote by position so the outcome is reproducible
    for (i, id) in ids.iter().enumerate() {
        let choice = if i % 3 == 2 { "south" } else { "north" };
        network.register(
            id.clone(),
            Channel::Vote,
            voter_handler(id.clone(), move |_| VoteChoice::Value(choice.to_string())),
        );
    }

    let manager = ConsensusManager::new(config.consensus.clone());
    let threshold = config.consensus.default_threshold;
    manager.register("quorum", Algorithm::quorum(network.endpoint("coordinator"), threshold)?);
    manager.register("weighted", Algorithm::weighted(network.endpoint("coordinator"), threshold)?);

    let proposal = Proposal::new("heading", vec!["north".to_string(), "south".to_string()]);
    let participants: Vec<Agent> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| Agent::new(id.clone()).with_weight(if i % 3 == 2 { 4.0 } else { 1.0 }))
        .collect();

    for name in manager.algorithms() {
        let result = manager
            .request_with_defaults(&name, proposal.clone(), participants.clone())
            .await?;
        match &result.error {
            None => info!(algorithm = %name, value = ?result.value, latency_ms = result.elapsed.as_millis() as u64, "Vote decided"),
            Some(e) => warn!(algorithm = %name, error = %e, "Vote undecided"),
        }
    }
    for (name, stats) in manager.all_stats() {
        info!(algorithm = %name, invocations = stats.invocations, success_rate = stats.success_rate, "Vote statistics");
    }
    Ok(())
}

async fn run_raft(
    network: &SimulatedNetwork,
    ids: &[String],
    config: &SwarmConfig,
    storage: &Arc<dyn Storage>,
) -> Result<(), Box<dyn Error>> {
    let mut nodes = Vec::new();
    for id in ids {
        let raft = Arc::new(RaftConsensus::new(
            id.clone(),
            ids.to_vec(),
            network.endpoint(id.clone()),
            config.raft.clone(),
            Arc::clone(storage),
        )?);
        network.register(id.clone(), Channel::Raft, raft.handler());
        raft.spawn();
        nodes.push(raft);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let leader = loop {
        if let Some(leader) = nodes.iter().find(|raft| raft.role() == Role::Leader) {
            break Arc::clone(leader);
        }
        if Instant::now() >= deadline {
            warn!("Raft: no leader elected in time");
            return Ok(());
        }
        tokio::time::sleep(config.raft.heartbeat_interval).await;
    };
    info!(leader = %leader.status().id, term = leader.term(), "Raft: leader elected");

    for step in 0..3 {
        let entry = leader
            .propose(json!({ "waypoint": step }), Duration::from_secs(1))
            .await?;
        info!(index = entry.index, term = entry.term, "Raft: committed");
    }
    for raft in &nodes {
        raft.shutdown().await;
    }
    Ok(())
}

async fn run_gossip(
    network: &SimulatedNetwork,
    ids: &[String],
    config: &SwarmConfig,
) -> Result<(), Box<dyn Error>> {
    let nodes: Vec<Arc<GossipNode>> = ids
        .iter()
        .map(|id| {
            let node = Arc::new(GossipNode::new(network.endpoint(id.clone()), ConflictResolver::default()));
            network.register(id.clone(), Channel::Gossip, node.handler());
            node
        })
        .collect();
    for (i, node) in nodes.iter().enumerate() {
        node.put(format!("battery/{}", node.id()), Payload::Value(json!(100 - (i * 7) % 100)));
    }

    let protocol = GossipProtocol::new(nodes, config.gossip.clone())?;
    let report = protocol.run(Instant::now() + Duration::from_secs(5)).await;
    info!(rounds = report.rounds, ratio = report.ratio, outcome = ?report.outcome, "Gossip: finished");
    Ok(())
}

async fn run_sync(
    network: &SimulatedNetwork,
    config: &SwarmConfig,
    storage: &Arc<dyn Storage>,
) -> Result<(), Box<dyn Error>> {
    let make = |id: &str| {
        let sync = StateSynchronizer::with_storage(
            network.endpoint(id),
            ConflictResolver::default(),
            config.sync.clone(),
            Arc::clone(storage),
        );
        sync.add_listener(Arc::new(SnapshotListener::new(Arc::clone(storage))));
        network.register(id, Channel::Sync, sync.handler());
        sync
    };
    let scout = make("scout");
    let base = make("base");
    scout.put("map/sector-7", Payload::Value(json!({ "obstacles": 3 })));
    base.put("mission", Payload::Value(json!("survey")));

    let first = scout.sync_default(base.id()).await?;
    let second = scout.sync_default(base.id()).await?;
    info!(sent = first.sent, received = first.received, "Sync: first round");
    info!(sent = second.sent, received = second.received, "Sync: repeat round");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    let agents: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(5);

    if args.iter().any(|a| a == "--json") {
        #[cfg(feature = "json")]
        logger::init_logger_json();
        #[cfg(not(feature = "json"))]
        logger::init_logger();
    } else if args.iter().any(|a| a == "--verbose") {
        logger::init_logger_detailed();
    } else {
        logger::init_logger();
    }

    let config = SwarmConfig::from_env()?;
    let storage = open_storage(&config)?;
    info!(agents, storage = ?config.storage_path, memory = %logger::get_memory_usage(), "Swarm starting");

    let network = SimulatedNetwork::new();
    let ids: Vec<String> = (0..agents).map(|i| format!("agent-{}", i)).collect();

    run_votes(&network, &ids, &config).await?;
    run_raft(&network, &ids, &config, &storage).await?;
    run_gossip(&network, &ids, &config).await?;
    run_sync(&network, &config, &storage).await?;

    info!("Swarm walkthrough complete");
    Ok(())
}
