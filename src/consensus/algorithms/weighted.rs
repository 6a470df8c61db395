//! Weighted voting with optional expert presets

use super::quorum::check_threshold;
use crate::consensus::tally::{Ballot, Denominator};
use crate::consensus::voter::collect_votes;
use crate::consensus::{ConsensusAlgorithm, ConsensusRequest, ConsensusRequirements, Decision};
use crate::error::{ConsensusError, Result, ValidationError};
use crate::network::Transport;
use crate::types::{Agent, AgentId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

fn check_weight(agent: &str, weight: f64) -> std::result::Result<f64, ValidationError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(weight)
    } else {
        Err(ValidationError::InvalidWeight {
            agent: agent.to_string(),
            weight,
        })
    }
}

/// Named weighting scheme favouring agents from designated domains
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertPreset {
    pub name: String,
    domain_weights: HashMap<String, f64>,
}

impl ExpertPreset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain_weights: HashMap::new(),
        }
    }

    pub fn with_domain(
        mut self,
        domain: impl Into<String>,
        weight: f64,
    ) -> std::result::Result<Self, ValidationError> {
        let domain = domain.into();
        check_weight(&domain, weight)?;
        self.domain_weights.insert(domain, weight);
        Ok(self)
    }

    pub fn weight_for(&self, domain: &str) -> Option<f64> {
        self.domain_weights.get(domain).copied()
    }
}

pub struct WeightedConsensus {
    transport: Arc<dyn Transport>,
    threshold: f64,
    weights: RwLock<HashMap<AgentId, f64>>,
    preset: RwLock<Option<ExpertPreset>>,
}

impl WeightedConsensus {
    pub fn new(
        transport: Arc<dyn Transport>,
        threshold: f64,
    ) -> std::result::Result<Self, ValidationError> {
        Ok(Self {
            transport,
            threshold: check_threshold(threshold)?,
            weights: RwLock::new(HashMap::new()),
            preset: RwLock::new(None),
        })
    }

    /// Applies to requests started after this call
    pub fn set_weight(
        &self,
        agent: impl Into<AgentId>,
        weight: f64,
    ) -> std::result::Result<(), ValidationError> {
        let agent = agent.into();
        check_weight(&agent, weight)?;
        self.weights.write().insert(agent, weight);
        Ok(())
    }

    pub fn set_preset(&self, preset: ExpertPreset) {
        debug!(preset = %preset.name, "Weighted: expert preset installed");
        *self.preset.write() = Some(preset);
    }

    pub fn clear_preset(&self) {
        *self.preset.write() = None;
    }

    /// Participant weight, else table entry, else preset domain weight, else 1.0
    fn weight_of(
        &self,
        agent: &Agent,
        table: &HashMap<AgentId, f64>,
        preset: Option<&ExpertPreset>,
    ) -> std::result::Result<f64, ValidationError> {
        let weight = agent
            .weight
            .or_else(|| table.get(&agent.id).copied())
            .or_else(|| {
                let domain = agent.domain.as_deref()?;
                preset?.weight_for(domain)
            })
            .unwrap_or(1.0);
        check_weight(&agent.id, weight)
    }

    /// Capture every participant's weight at request start
    pub fn snapshot(
        &self,
        participants: &[Agent],
    ) -> std::result::Result<BTreeMap<AgentId, f64>, ValidationError> {
        let table = self.weights.read();
        let preset = self.preset.read();
        participants
            .iter()
            .map(|agent| {
                self.weight_of(agent, &table, preset.as_ref())
                    .map(|weight| (agent.id.clone(), weight))
            })
            .collect()
    }
}

#[async_trait]
impl ConsensusAlgorithm for WeightedConsensus {
    async fn decide(&self, request: &ConsensusRequest) -> Result<Decision> {
        let threshold = check_threshold(request.config.threshold.unwrap_or(self.threshold))?;
        let weights = self.snapshot(&request.participants)?;
        let total: f64 = weights.values().sum();
        if total <= 0.0 {
            return Err(ConsensusError::no_quorum("total participant weight is zero"));
        }
        debug!(request_id = request.id, total_weight = total, "Weighted: weights captured");

        let ballot = Ballot::new(threshold, Denominator::TotalWeight, total);
        collect_votes(&self.transport, request, &weights, ballot).await
    }

    fn name(&self) -> &str {
        "Weighted"
    }

    fn requirements(&self) -> ConsensusRequirements {
        ConsensusRequirements {
            requires_majority: false,
            min_nodes: None,
            description: format!(
                "Weighted voting: a value needs {:.0}% of total participant weight",
                self.threshold * 100.0
            ),
        }
    }
}
