//! Cluster scenarios over the simulated network

use super::*;
use crate::network::sim::SimulatedNetwork;
use crate::network::Channel;
use crate::storage::MemoryStorage;
use serde_json::json;

// Initialize logger for tests (only once)
static INIT: std::sync::Once = std::sync::Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();
    });
}

struct Cluster {
    network: SimulatedNetwork,
    nodes: Vec<Arc<RaftConsensus>>,
}

fn cluster(size: usize) -> Cluster {
    let network = SimulatedNetwork::new();
    let ids: Vec<AgentId> = (0..size).map(|i| format!("n{}", i)).collect();
    let nodes = ids
        .iter()
        .map(|id| {
            let raft = Arc::new(
                RaftConsensus::new(
                    id.clone(),
                    ids.clone(),
                    network.endpoint(id.clone()),
                    RaftConfig::default(),
                    Arc::new(MemoryStorage::new()),
                )
                .unwrap(),
            );
            network.register(id.clone(), Channel::Raft, raft.handler());
            raft
        })
        .collect();
    Cluster { network, nodes }
}

#[tokio::test]
async fn test_minority_leader_steps_down_after_partition_heals() {
    init();
    let c = cluster(5);

    assert!(c.nodes[0].campaign().await.unwrap());
    assert_eq!(c.nodes[0].term(), 1);
    for follower in &c.nodes[1..] {
        assert_eq!(follower.leader(), Some("n0".to_string()));
    }

    c.network.partition(&[&["n0", "n1"], &["n2", "n3", "n4"]]);

    // Two of five nodes cannot commit
    let err = c.nodes[0]
        .propose(json!({"op": "minority"}), Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::Timeout { .. }));
    assert_eq!(c.nodes[0].commit_index(), 0);

    assert!(c.nodes[2].campaign().await.unwrap());
    assert_eq!(c.nodes[2].term(), 2);
    assert_eq!(c.nodes[0].role(), Role::Leader);

    c.network.heal();
    c.nodes[0].heartbeat().await.unwrap();
    assert_eq!(c.nodes[0].role(), Role::Follower);
    assert_eq!(c.nodes[0].term(), 2);

    let entry = c.nodes[2]
        .propose(json!({"op": "majority"}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(entry.index, 1);
    assert_eq!(entry.term, 2);

    c.nodes[2].heartbeat().await.unwrap();
    // The uncommitted minority entry was replaced
    assert_eq!(c.nodes[0].log_entry(1), Some(entry));
    assert_eq!(c.nodes[0].commit_index(), 1);
    assert_eq!(c.nodes[0].leader(), Some("n2".to_string()));
}

#[tokio::test]
async fn test_follower_rejects_proposals() {
    init();
    let c = cluster(3);
    c.nodes[0].campaign().await.unwrap();

    let err = c.nodes[1]
        .propose(json!("x"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ConsensusError::NotLeader {
            leader: Some("n0".to_string())
        }
    );
}

#[tokio::test]
async fn test_committed_entries_applied_in_order_everywhere() {
    init();
    let c = cluster(3);
    let applied: Vec<Arc<Mutex<Vec<serde_json::Value>>>> = c
        .nodes
        .iter()
        .map(|raft| {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            raft.on_apply(move |entry| sink.lock().push(entry.command.clone()));
            seen
        })
        .collect();

    c.nodes[0].campaign().await.unwrap();
    for i in 0..3 {
        c.nodes[0]
            .propose(json!({"seq": i}), Duration::from_secs(1))
            .await
            .unwrap();
    }
    c.nodes[0].heartbeat().await.unwrap();

    let expected: Vec<_> = (0..3).map(|i| json!({"seq": i})).collect();
    for seen in &applied {
        assert_eq!(*seen.lock(), expected);
    }
}

#[tokio::test]
async fn test_propose_without_deadline_commits() {
    init();
    let c = cluster(3);
    c.nodes[0].campaign().await.unwrap();

    let entry = c.nodes[0]
        .propose(json!("unbounded"), Duration::MAX)
        .await
        .unwrap();
    assert_eq!(c.nodes[0].commit_index(), entry.index);
}

#[tokio::test]
async fn test_restart_reloads_persisted_state() {
    init();
    let network = SimulatedNetwork::new();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    let first = RaftConsensus::new(
        "solo",
        vec![],
        network.endpoint("solo"),
        RaftConfig::default(),
        Arc::clone(&storage),
    )
    .unwrap();
    assert!(first.campaign().await.unwrap());
    first
        .propose(json!({"set": "a"}), Duration::from_millis(100))
        .await
        .unwrap();
    drop(first);

    let restarted = RaftConsensus::new(
        "solo",
        vec![],
        network.endpoint("solo"),
        RaftConfig::default(),
        storage,
    )
    .unwrap();
    let status = restarted.status();
    assert_eq!(status.term, 1);
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.last_log_index, 1);
    assert_eq!(
        restarted.log_entry(1).map(|e| e.command),
        Some(json!({"set": "a"}))
    );
}

#[tokio::test]
async fn test_background_driver_elects_one_leader() {
    init();
    let c = cluster(3);
    for raft in &c.nodes {
        raft.spawn();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let leader = loop {
        let leaders: Vec<&Arc<RaftConsensus>> = c
            .nodes
            .iter()
            .filter(|raft| raft.role() == Role::Leader)
            .collect();
        if leaders.len() == 1 {
            break Arc::clone(leaders[0]);
        }
        assert!(Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let entry = leader
        .propose(json!("driven"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(entry.term, leader.term());

    for raft in &c.nodes {
        raft.shutdown().await;
    }
}

#[tokio::test]
async fn test_decide_through_consensus_contract() {
    init();
    let c = cluster(3);
    c.nodes[0].campaign().await.unwrap();

    let request = ConsensusRequest {
        id: 9,
        algorithm: "raft".into(),
        proposal: crate::consensus::Proposal::single("config", "v2"),
        participants: vec![],
        deadline: Instant::now() + Duration::from_secs(1),
        config: Default::default(),
    };
    let decision = c.nodes[0].decide(&request).await.unwrap();
    assert_eq!(decision.value, "v2");
    assert!(decision.tally.fraction("v2") > 0.5);
    assert_eq!(c.nodes[0].name(), "Raft");
    assert!(c.nodes[0].requirements().requires_majority);
}
