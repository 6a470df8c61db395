//! Consensus algorithm trait definition

use crate::consensus::types::{ConsensusRequest, ConsensusRequirements, Decision};
use crate::error::Result;
use async_trait::async_trait;

/// One "propose → decision" contract shared by every algorithm.
///
/// The manager validates the request before calling [`decide`] and enforces
/// the request deadline around it.
///
/// [`decide`]: ConsensusAlgorithm::decide
#[async_trait]
pub trait ConsensusAlgorithm: Send + Sync {
    /// Drive the request to a decision or fail with the reason it could not be reached
    async fn decide(&self, request: &ConsensusRequest) -> Result<Decision>;

    /// Get the algorithm name
    fn name(&self) -> &str;

    /// Get consensus requirements (e.g., "majority", "weighted", "leader")
    fn requirements(&self) -> ConsensusRequirements;
}
