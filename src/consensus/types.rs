//! Consensus types and data structures

use crate::error::ConsensusError;
use crate::types::{now_millis, Agent, AgentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// What participants are asked to decide on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub subject: String,
    /// Candidate values; a single-candidate proposal is a yes/abstain question
    pub candidates: Vec<String>,
}

impl Proposal {
    pub fn new(subject: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            candidates,
        }
    }

    pub fn single(subject: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(subject, vec![value.into()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    Value(String),
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent: AgentId,
    pub choice: VoteChoice,
    /// Weight captured when the request started
    pub weight: f64,
    pub timestamp: Timestamp,
}

impl Vote {
    pub fn new(agent: impl Into<AgentId>, choice: VoteChoice) -> Self {
        Self {
            agent: agent.into(),
            choice,
            weight: 1.0,
            timestamp: now_millis(),
        }
    }
}

/// Per-request overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestConfig {
    /// Decision threshold in (0, 1]; falls back to the algorithm's own
    pub threshold: Option<f64>,
}

impl RequestConfig {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold: Some(threshold),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusRequest {
    pub id: u64,
    pub algorithm: String,
    pub proposal: Proposal,
    pub participants: Vec<Agent>,
    pub deadline: Instant,
    pub config: RequestConfig,
}

impl ConsensusRequest {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Vote totals; counts are weights for weighted algorithms
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub counts: BTreeMap<String, f64>,
    pub abstentions: usize,
    /// Participants whose vote never arrived
    pub missing: usize,
    /// Denominator the threshold was applied against
    pub denominator: f64,
}

impl VoteTally {
    pub fn fraction(&self, value: &str) -> f64 {
        if self.denominator <= 0.0 {
            return 0.0;
        }
        self.counts.get(value).copied().unwrap_or(0.0) / self.denominator
    }
}

/// Successful outcome of one algorithm run
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub value: String,
    pub tally: VoteTally,
}

/// Result returned to callers of the consensus manager
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    pub request_id: u64,
    pub algorithm: String,
    pub decided: bool,
    pub value: Option<String>,
    pub tally: VoteTally,
    pub elapsed: Duration,
    pub error: Option<ConsensusError>,
}

impl ConsensusResult {
    pub fn is_timeout(&self) -> bool {
        matches!(self.error, Some(ConsensusError::Timeout { .. }))
    }
}

/// Consensus requirements
#[derive(Debug, Clone)]
pub struct ConsensusRequirements {
    /// Whether majority voting is required
    pub requires_majority: bool,
    /// Minimum nodes needed (None means no minimum)
    pub min_nodes: Option<usize>,
    /// Description of the consensus mechanism
    pub description: String,
}
