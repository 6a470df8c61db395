//! Threshold voting over non-abstaining votes

use crate::consensus::tally::{Ballot, Denominator};
use crate::consensus::voter::collect_votes;
use crate::consensus::{ConsensusAlgorithm, ConsensusRequest, ConsensusRequirements, Decision};
use crate::error::{Result, ValidationError};
use crate::network::Transport;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) fn check_threshold(threshold: f64) -> std::result::Result<f64, ValidationError> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(threshold)
    } else {
        Err(ValidationError::InvalidThreshold(threshold))
    }
}

/// One vote per participant; a value wins when its share of the
/// non-abstaining votes reaches the threshold.
pub struct QuorumConsensus {
    transport: Arc<dyn Transport>,
    threshold: f64,
}

impl QuorumConsensus {
    pub const SIMPLE_MAJORITY: f64 = 0.51;
    pub const SUPERMAJORITY: f64 = 0.66;
    pub const UNANIMOUS: f64 = 1.0;

    pub fn new(
        transport: Arc<dyn Transport>,
        threshold: f64,
    ) -> std::result::Result<Self, ValidationError> {
        Ok(Self {
            transport,
            threshold: check_threshold(threshold)?,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

#[async_trait]
impl ConsensusAlgorithm for QuorumConsensus {
    async fn decide(&self, request: &ConsensusRequest) -> Result<Decision> {
        let threshold = check_threshold(request.config.threshold.unwrap_or(self.threshold))?;
        let weights: BTreeMap<_, _> = request
            .participants
            .iter()
            .map(|agent| (agent.id.clone(), 1.0))
            .collect();
        let ballot = Ballot::new(
            threshold,
            Denominator::NonAbstaining,
            request.participants.len() as f64,
        );
        collect_votes(&self.transport, request, &weights, ballot).await
    }

    fn name(&self) -> &str {
        "Quorum"
    }

    fn requirements(&self) -> ConsensusRequirements {
        ConsensusRequirements {
            requires_majority: self.threshold > 0.5,
            min_nodes: Some(1),
            description: format!(
                "Quorum voting: a value needs {:.0}% of non-abstaining votes",
                self.threshold * 100.0
            ),
        }
    }
}
