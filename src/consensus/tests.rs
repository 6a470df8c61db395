//! Tests for consensus algorithms

#[cfg(test)]
mod consensus_tests {
    use crate::consensus::*;
    use crate::error::{ConsensusError, ValidationError};
    use crate::network::sim::SimulatedNetwork;
    use crate::network::Channel;
    use crate::types::Agent;
    use std::sync::Arc;
    use tokio::time::Duration;

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

    /// Register one voter per `(agent, choice)`; `None` abstains
    fn swarm(ballots: &[(&str, Option<&str>)]) -> (SimulatedNetwork, Vec<Agent>) {
        let network = SimulatedNetwork::new();
        let mut agents = Vec::new();
        for (id, choice) in ballots {
            let choice = choice.map(str::to_string);
            network.register(
                *id,
                Channel::Vote,
                voter_handler(*id, move |_proposal| match &choice {
                    Some(value) => VoteChoice::Value(value.clone()),
                    None => VoteChoice::Abstain,
                }),
            );
            agents.push(Agent::new(*id));
        }
        (network, agents)
    }

    fn ab_proposal() -> Proposal {
        Proposal::new("leader-color", vec!["A".to_string(), "B".to_string()])
    }

    fn five_agents() -> (SimulatedNetwork, Vec<Agent>) {
        swarm(&[
            ("a1", Some("A")),
            ("a2", Some("A")),
            ("a3", Some("A")),
            ("a4", Some("B")),
            ("a5", Some("B")),
        ])
    }

    #[tokio::test]
    async fn test_quorum_simple_majority_decides() {
        init();
        let (network, agents) = five_agents();
        let manager = ConsensusManager::default();
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let result = manager
            .request(
                "quorum",
                ab_proposal(),
                agents,
                Duration::from_secs(1),
                RequestConfig::default(),
            )
            .await
            .unwrap();

        assert!(result.decided);
        assert_eq!(result.value.as_deref(), Some("A"));
        assert_eq!(result.algorithm, "quorum");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_quorum_supermajority_has_no_quorum() {
        init();
        let (network, agents) = five_agents();
        let manager = ConsensusManager::default();
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let result = manager
            .request(
                "quorum",
                ab_proposal(),
                agents,
                Duration::from_secs(1),
                RequestConfig::with_threshold(0.75),
            )
            .await
            .unwrap();

        assert!(!result.decided);
        assert!(result.value.is_none());
        assert!(matches!(result.error, Some(ConsensusError::NoQuorum { .. })));
    }

    #[tokio::test]
    async fn test_all_abstain_is_no_quorum() {
        init();
        let (network, agents) = swarm(&[("a", None), ("b", None), ("c", None)]);
        let manager = ConsensusManager::default();
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let result = manager
            .request_with_defaults("quorum", ab_proposal(), agents)
            .await
            .unwrap();
        assert!(matches!(result.error, Some(ConsensusError::NoQuorum { .. })));
    }

    #[tokio::test]
    async fn test_weighted_expert_outvotes_majority() {
        init();
        let (network, _) = swarm(&[("a", Some("X")), ("b", Some("Y")), ("c", Some("Y"))]);
        let manager = ConsensusManager::default();
        manager.register(
            "weighted",
            Algorithm::weighted(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let participants = vec![
            Agent::new("a").with_weight(3.0),
            Agent::new("b").with_weight(1.0),
            Agent::new("c").with_weight(1.0),
        ];
        let result = manager
            .request(
                "weighted",
                Proposal::new("route", vec!["X".to_string(), "Y".to_string()]),
                participants,
                Duration::from_secs(1),
                RequestConfig::default(),
            )
            .await
            .unwrap();

        assert!(result.decided);
        assert_eq!(result.value.as_deref(), Some("X"));
        assert!((result.tally.fraction("X") - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_weighted_zero_total_weight() {
        init();
        let (network, _) = swarm(&[("a", Some("X")), ("b", Some("X"))]);
        let manager = ConsensusManager::default();
        manager.register(
            "weighted",
            Algorithm::weighted(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let result = manager
            .request(
                "weighted",
                Proposal::single("route", "X"),
                vec![Agent::new("a").with_weight(0.0), Agent::new("b").with_weight(0.0)],
                Duration::from_secs(1),
                RequestConfig::default(),
            )
            .await
            .unwrap();
        assert!(matches!(result.error, Some(ConsensusError::NoQuorum { .. })));

        let err = manager
            .request(
                "weighted",
                Proposal::single("route", "X"),
                vec![Agent::new("a").with_weight(-1.0)],
                Duration::from_secs(1),
                RequestConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::Validation(ValidationError::InvalidWeight { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_validation() {
        init();
        let (network, agents) = five_agents();
        let manager = ConsensusManager::default();
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let unknown = manager
            .request(
                "paxos",
                ab_proposal(),
                agents.clone(),
                Duration::from_secs(1),
                RequestConfig::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            unknown,
            ConsensusError::Validation(ValidationError::UnknownAlgorithm("paxos".into()))
        );

        let empty = manager
            .request(
                "quorum",
                ab_proposal(),
                vec![],
                Duration::from_secs(1),
                RequestConfig::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            empty,
            ConsensusError::Validation(ValidationError::InvalidParticipants)
        );

        let bad_threshold = manager
            .request(
                "quorum",
                ab_proposal(),
                agents,
                Duration::from_secs(1),
                RequestConfig::with_threshold(1.5),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            bad_threshold,
            ConsensusError::Validation(ValidationError::InvalidThreshold(_))
        ));

        // Validation failures never reach the algorithm
        assert_eq!(manager.stats("quorum").unwrap().invocations, 0);
    }

    #[tokio::test]
    async fn test_deadline_expiry_returns_timeout_result() {
        init();
        let (network, agents) = five_agents();
        network.set_latency(Duration::from_millis(200));
        let manager = ConsensusManager::default();
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let result = manager
            .request(
                "quorum",
                ab_proposal(),
                agents,
                Duration::from_millis(50),
                RequestConfig::default(),
            )
            .await
            .unwrap();

        assert!(!result.decided);
        assert!(result.is_timeout());
        assert!(result.elapsed < Duration::from_millis(200));
        let stats = manager.stats("quorum").unwrap();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.successes, 0);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_means_no_deadline() {
        init();
        let (network, agents) = five_agents();
        let manager = ConsensusManager::default();
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.51).unwrap(),
        );

        let result = manager
            .request(
                "quorum",
                ab_proposal(),
                agents,
                Duration::MAX,
                RequestConfig::default(),
            )
            .await
            .unwrap();

        assert!(result.decided);
        assert_eq!(result.value.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_unreachable_participants_are_skipped() {
        init();
        let (network, agents) = swarm(&[("a", Some("A")), ("b", Some("A")), ("c", Some("B"))]);
        network.set_down("c", true);
        let manager = ConsensusManager::default();
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.66).unwrap(),
        );

        let result = manager
            .request(
                "quorum",
                ab_proposal(),
                agents,
                Duration::from_secs(1),
                RequestConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.value.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_update_stats_independently() {
        init();
        let (network, agents) = five_agents();
        let manager = Arc::new(ConsensusManager::default());
        manager.register(
            "quorum",
            Algorithm::quorum(network.endpoint("coordinator"), 0.51).unwrap(),
        );
        manager.register(
            "unanimous",
            Algorithm::quorum(network.endpoint("coordinator"), 1.0).unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            let manager = Arc::clone(&manager);
            let agents = agents.clone();
            let name = if i % 2 == 0 { "quorum" } else { "unanimous" };
            handles.push(tokio::spawn(async move {
                manager
                    .request(
                        name,
                        ab_proposal(),
                        agents,
                        Duration::from_secs(1),
                        RequestConfig::default(),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().request_id);
        }
        assert_eq!(ids.len(), 10);

        let all = manager.all_stats();
        assert_eq!(all["quorum"].invocations, 5);
        assert_eq!(all["quorum"].success_rate, 1.0);
        assert_eq!(all["unanimous"].invocations, 5);
        assert_eq!(all["unanimous"].failures, 5);
        assert_eq!(all["unanimous"].success_rate, 0.0);
    }

    #[test]
    fn test_registry_management() {
        init();
        let network = SimulatedNetwork::new();
        let manager = ConsensusManager::default();
        manager.register(
            "weighted",
            Algorithm::weighted(network.endpoint("c"), 0.6).unwrap(),
        );
        manager.register("quorum", Algorithm::quorum(network.endpoint("c"), 0.51).unwrap());

        assert_eq!(manager.algorithms(), vec!["quorum", "weighted"]);
        let requirements = manager.requirements("quorum").unwrap();
        assert!(requirements.requires_majority);
        assert!(!manager.requirements("weighted").unwrap().requires_majority);

        assert!(manager.unregister("weighted"));
        assert!(!manager.unregister("weighted"));
        assert!(manager.stats("weighted").is_none());
        assert_eq!(manager.stats("quorum").unwrap().invocations, 0);
    }

    #[test]
    fn test_invalid_algorithm_threshold() {
        init();
        let network = SimulatedNetwork::new();
        assert!(matches!(
            Algorithm::quorum(network.endpoint("c"), 0.0),
            Err(ValidationError::InvalidThreshold(_))
        ));
        assert!(Algorithm::weighted(network.endpoint("c"), 1.01).is_err());
    }
}
