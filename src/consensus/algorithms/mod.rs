//! Consensus algorithm implementations

pub mod quorum;
pub mod raft;
pub mod weighted;

pub use quorum::QuorumConsensus;
pub use raft::RaftConsensus;
pub use weighted::{ExpertPreset, WeightedConsensus};

use crate::consensus::{ConsensusAlgorithm, ConsensusRequest, ConsensusRequirements, Decision};
use crate::error::{Result, ValidationError};
use crate::network::Transport;
use async_trait::async_trait;
use std::sync::Arc;

/// Closed set of algorithms the manager can dispatch to
pub enum Algorithm {
    Quorum(QuorumConsensus),
    Weighted(WeightedConsensus),
    /// Shared so the node can keep serving RPCs and its driver outside the manager
    Raft(Arc<RaftConsensus>),
}

impl Algorithm {
    pub fn quorum(
        transport: Arc<dyn Transport>,
        threshold: f64,
    ) -> std::result::Result<Self, ValidationError> {
        QuorumConsensus::new(transport, threshold).map(Algorithm::Quorum)
    }

    pub fn weighted(
        transport: Arc<dyn Transport>,
        threshold: f64,
    ) -> std::result::Result<Self, ValidationError> {
        WeightedConsensus::new(transport, threshold).map(Algorithm::Weighted)
    }

    pub fn raft(node: Arc<RaftConsensus>) -> Self {
        Algorithm::Raft(node)
    }

    fn inner(&self) -> &dyn ConsensusAlgorithm {
        match self {
            Algorithm::Quorum(quorum) => quorum,
            Algorithm::Weighted(weighted) => weighted,
            Algorithm::Raft(raft) => raft.as_ref(),
        }
    }
}

#[async_trait]
impl ConsensusAlgorithm for Algorithm {
    async fn decide(&self, request: &ConsensusRequest) -> Result<Decision> {
        self.inner().decide(request).await
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn requirements(&self) -> ConsensusRequirements {
        self.inner().requirements()
    }
}
