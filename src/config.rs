//! Runtime configuration
//!
//! Defaults can be overridden from the environment (or a `.env` file) with
//! `SWARM_*` variables; see [`SwarmConfig::from_env`].

use crate::error::ValidationError;
use crate::synchronizer::SyncMode;
use std::str::FromStr;
use std::time::Duration;

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn check_ratio(field: &str, value: f64) -> Result<(), ValidationError> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(invalid(field, format!("{} is outside (0, 1]", value)));
    }
    Ok(())
}

fn check_nonzero(field: &str, value: Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusConfig {
    /// Deadline applied when a caller does not pass one
    pub default_timeout: Duration,
    pub default_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(5000),
            default_threshold: 0.51,
        }
    }
}

impl ConsensusConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.default_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_nonzero("consensus.default_timeout", self.default_timeout)?;
        check_ratio("consensus.default_threshold", self.default_threshold)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Per-peer bound on a single RequestVote or AppendEntries call
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(100),
        }
    }
}

impl RaftConfig {
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_nonzero("raft.election_timeout_min", self.election_timeout_min)?;
        check_nonzero("raft.heartbeat_interval", self.heartbeat_interval)?;
        check_nonzero("raft.rpc_timeout", self.rpc_timeout)?;
        if self.election_timeout_min > self.election_timeout_max {
            return Err(invalid(
                "raft.election_timeout",
                format!(
                    "min {:?} exceeds max {:?}",
                    self.election_timeout_min, self.election_timeout_max
                ),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(invalid(
                "raft.heartbeat_interval",
                "must be shorter than the minimum election timeout",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GossipConfig {
    /// Peers contacted by each agent per round
    pub fanout: usize,
    /// Fraction of agents that must share a digest to count as converged
    pub convergence_ratio: f64,
    pub max_rounds: usize,
    pub exchange_timeout: Duration,
    /// Fixed RNG seed for reproducible peer selection
    pub seed: Option<u64>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            convergence_ratio: 0.95,
            max_rounds: 50,
            exchange_timeout: Duration::from_millis(200),
            seed: None,
        }
    }
}

impl GossipConfig {
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_convergence_ratio(mut self, ratio: f64) -> Self {
        self.convergence_ratio = ratio;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fanout == 0 {
            return Err(invalid("gossip.fanout", "must be at least 1"));
        }
        if self.max_rounds == 0 {
            return Err(invalid("gossip.max_rounds", "must be at least 1"));
        }
        check_ratio("gossip.convergence_ratio", self.convergence_ratio)?;
        check_nonzero("gossip.exchange_timeout", self.exchange_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub timeout: Duration,
    pub default_mode: SyncMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            default_mode: SyncMode::Delta,
        }
    }
}

impl SyncConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_nonzero("sync.timeout", self.timeout)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwarmConfig {
    pub consensus: ConsensusConfig,
    pub raft: RaftConfig,
    pub gossip: GossipConfig,
    pub sync: SyncConfig,
    /// SQLite database path; in-memory storage when unset
    pub storage_path: Option<String>,
}

impl SwarmConfig {
    /// Load defaults overridden by `SWARM_*` environment variables
    pub fn from_env() -> Result<Self, ValidationError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = SwarmConfig::default();

        if let Some(ms) = parse::<u64, _>(&lookup, "SWARM_CONSENSUS_TIMEOUT_MS")? {
            config.consensus.default_timeout = Duration::from_millis(ms);
        }
        if let Some(t) = parse(&lookup, "SWARM_CONSENSUS_THRESHOLD")? {
            config.consensus.default_threshold = t;
        }

        if let Some(ms) = parse::<u64, _>(&lookup, "SWARM_RAFT_ELECTION_TIMEOUT_MIN_MS")? {
            config.raft.election_timeout_min = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SWARM_RAFT_ELECTION_TIMEOUT_MAX_MS")? {
            config.raft.election_timeout_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SWARM_RAFT_HEARTBEAT_MS")? {
            config.raft.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SWARM_RAFT_RPC_TIMEOUT_MS")? {
            config.raft.rpc_timeout = Duration::from_millis(ms);
        }

        if let Some(fanout) = parse(&lookup, "SWARM_GOSSIP_FANOUT")? {
            config.gossip.fanout = fanout;
        }
        if let Some(ratio) = parse(&lookup, "SWARM_GOSSIP_CONVERGENCE_RATIO")? {
            config.gossip.convergence_ratio = ratio;
        }
        if let Some(rounds) = parse(&lookup, "SWARM_GOSSIP_MAX_ROUNDS")? {
            config.gossip.max_rounds = rounds;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "SWARM_GOSSIP_EXCHANGE_TIMEOUT_MS")? {
            config.gossip.exchange_timeout = Duration::from_millis(ms);
        }
        config.gossip.seed = parse(&lookup, "SWARM_GOSSIP_SEED")?;

        if let Some(ms) = parse::<u64, _>(&lookup, "SWARM_SYNC_TIMEOUT_MS")? {
            config.sync.timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = lookup("SWARM_SYNC_MODE") {
            config.sync.default_mode = match mode.to_ascii_lowercase().as_str() {
                "full" => SyncMode::Full,
                "delta" => SyncMode::Delta,
                other => {
                    return Err(invalid(
                        "SWARM_SYNC_MODE",
                        format!("expected 'full' or 'delta', got '{}'", other),
                    ))
                }
            };
        }

        config.storage_path = lookup("SWARM_STORAGE_PATH").filter(|p| !p.is_empty());

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.consensus.validate()?;
        self.raft.validate()?;
        self.gossip.validate()?;
        self.sync.validate()
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ValidationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(key, format!("cannot parse '{}': {}", raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gossip.fanout, 3);
        assert_eq!(config.sync.default_mode, SyncMode::Delta);
        assert_eq!(config.consensus.default_threshold, 0.51);
    }

    #[test]
    fn test_env_overrides() {
        let config = SwarmConfig::from_lookup(lookup_from(&[
            ("SWARM_GOSSIP_FANOUT", "5"),
            ("SWARM_GOSSIP_SEED", "42"),
            ("SWARM_RAFT_HEARTBEAT_MS", "20"),
            ("SWARM_SYNC_MODE", "FULL"),
            ("SWARM_STORAGE_PATH", "swarm.db"),
        ]))
        .unwrap();

        assert_eq!(config.gossip.fanout, 5);
        assert_eq!(config.gossip.seed, Some(42));
        assert_eq!(config.raft.heartbeat_interval, Duration::from_millis(20));
        assert_eq!(config.sync.default_mode, SyncMode::Full);
        assert_eq!(config.storage_path.as_deref(), Some("swarm.db"));
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let err = SwarmConfig::from_lookup(lookup_from(&[("SWARM_GOSSIP_FANOUT", "many")]))
            .unwrap_err();
        match err {
            ValidationError::InvalidConfig { field, .. } => {
                assert_eq!(field, "SWARM_GOSSIP_FANOUT")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(GossipConfig::default().with_fanout(0).validate().is_err());
        assert!(GossipConfig::default()
            .with_convergence_ratio(1.5)
            .validate()
            .is_err());
        assert!(ConsensusConfig::default()
            .with_threshold(0.0)
            .validate()
            .is_err());
        assert!(RaftConfig::default()
            .with_election_timeout(Duration::from_millis(300), Duration::from_millis(150))
            .validate()
            .is_err());
        assert!(RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(500))
            .validate()
            .is_err());
    }
}
