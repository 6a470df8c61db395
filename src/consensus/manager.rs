//! Algorithm registry and request dispatch

use crate::config::ConsensusConfig;
use crate::consensus::algorithms::Algorithm;
use crate::consensus::{
    ConsensusAlgorithm, ConsensusRequest, ConsensusRequirements, ConsensusResult, Proposal,
    RequestConfig, VoteTally,
};
use crate::error::{ConsensusError, Result, ValidationError};
use crate::types::{deadline_after, Agent};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Default)]
struct AlgorithmStats {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    total_latency_us: AtomicU64,
}

impl AlgorithmStats {
    fn record(&self, result: &ConsensusResult) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(result.elapsed.as_micros() as u64, Ordering::Relaxed);
        let counter = if result.decided {
            &self.successes
        } else if result.is_timeout() {
            &self.timeouts
        } else {
            &self.failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsensusMetrics {
        let invocations = self.invocations.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let total_latency = self.total_latency_us.load(Ordering::Relaxed);
        ConsensusMetrics {
            invocations,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            success_rate: if invocations == 0 {
                0.0
            } else {
                successes as f64 / invocations as f64
            },
            mean_latency: if invocations == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total_latency / invocations)
            },
        }
    }
}

/// Per-algorithm counters as seen at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusMetrics {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub success_rate: f64,
    pub mean_latency: Duration,
}

struct Registered {
    algorithm: Arc<Algorithm>,
    stats: Arc<AlgorithmStats>,
}

pub struct ConsensusManager {
    registry: RwLock<HashMap<String, Registered>>,
    next_id: AtomicU64,
    config: ConsensusConfig,
}

impl Default for ConsensusManager {
    fn default() -> Self {
        Self::new(ConsensusConfig::default())
    }
}

impl ConsensusManager {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register under `name`, replacing any previous algorithm and its statistics
    pub fn register(&self, name: impl Into<String>, algorithm: Algorithm) {
        let name = name.into();
        info!(name = %name, algorithm = algorithm.name(), "ConsensusManager: algorithm registered");
        self.registry.write().insert(
            name,
            Registered {
                algorithm: Arc::new(algorithm),
                stats: Arc::new(AlgorithmStats::default()),
            },
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.registry.write().remove(name).is_some()
    }

    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn requirements(&self, name: &str) -> Option<ConsensusRequirements> {
        self.registry
            .read()
            .get(name)
            .map(|entry| entry.algorithm.requirements())
    }

    pub fn stats(&self, name: &str) -> Option<ConsensusMetrics> {
        self.registry
            .read()
            .get(name)
            .map(|entry| entry.stats.snapshot())
    }

    pub fn all_stats(&self) -> BTreeMap<String, ConsensusMetrics> {
        self.registry
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.stats.snapshot()))
            .collect()
    }

    /// [`request`](Self::request) with the configured default timeout
    pub async fn request_with_defaults(
        &self,
        name: &str,
        proposal: Proposal,
        participants: Vec<Agent>,
    ) -> Result<ConsensusResult> {
        self.request(
            name,
            proposal,
            participants,
            self.config.default_timeout,
            RequestConfig::default(),
        )
        .await
    }

    /// Run one consensus request.
    ///
    /// Validation problems are returned as `Err`. Anything that goes wrong
    /// once the algorithm runs (no quorum, timeout, unreachable peers) comes
    /// back as an undecided [`ConsensusResult`] carrying the error.
    pub async fn request(
        &self,
        name: &str,
        proposal: Proposal,
        participants: Vec<Agent>,
        timeout: Duration,
        config: RequestConfig,
    ) -> Result<ConsensusResult> {
        let (algorithm, stats) = {
            let registry = self.registry.read();
            let entry = registry
                .get(name)
                .ok_or_else(|| ValidationError::UnknownAlgorithm(name.to_string()))?;
            (Arc::clone(&entry.algorithm), Arc::clone(&entry.stats))
        };
        validate(&proposal, &participants, &config)?;

        let started = Instant::now();
        let request = ConsensusRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            algorithm: name.to_string(),
            proposal,
            participants,
            deadline: deadline_after(started, timeout),
            config,
        };
        debug!(request_id = request.id, algorithm = %name, participants = request.participants.len(), "ConsensusManager: dispatching");

        let outcome = match tokio::time::timeout_at(request.deadline, algorithm.decide(&request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ConsensusError::Timeout {
                elapsed: started.elapsed(),
            }),
        };
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(decision) => ConsensusResult {
                request_id: request.id,
                algorithm: name.to_string(),
                decided: true,
                value: Some(decision.value),
                tally: decision.tally,
                elapsed,
                error: None,
            },
            Err(ConsensusError::Validation(e)) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                stats.invocations.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
            Err(e) => ConsensusResult {
                request_id: request.id,
                algorithm: name.to_string(),
                decided: false,
                value: None,
                tally: VoteTally::default(),
                elapsed,
                error: Some(e),
            },
        };
        stats.record(&result);
        debug!(
            request_id = result.request_id,
            algorithm = %name,
            decided = result.decided,
            latency_ms = elapsed.as_millis() as u64,
            "ConsensusManager: request finished"
        );
        Ok(result)
    }
}

fn validate(
    proposal: &Proposal,
    participants: &[Agent],
    config: &RequestConfig,
) -> std::result::Result<(), ValidationError> {
    if participants.is_empty() {
        return Err(ValidationError::InvalidParticipants);
    }
    let mut seen = HashSet::new();
    if !participants.iter().all(|agent| seen.insert(agent.id.as_str())) {
        return Err(ValidationError::InvalidParticipants);
    }
    if proposal.subject.is_empty() {
        return Err(ValidationError::InvalidProposal("subject is empty".to_string()));
    }
    if proposal.candidates.is_empty() {
        return Err(ValidationError::InvalidProposal(
            "no candidate values".to_string(),
        ));
    }
    if let Some(threshold) = config.threshold {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ValidationError::InvalidThreshold(threshold));
        }
    }
    Ok(())
}
