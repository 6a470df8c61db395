//! Consensus algorithm abstraction and implementations
//!
//! Algorithms share one "propose → decision" contract and are registered
//! by name with a [`ConsensusManager`], which validates requests, applies
//! deadlines and keeps per-algorithm statistics.
//!
//! ## Structure
//! - `traits.rs` - Consensus algorithm trait definition
//! - `types.rs` - Requests, votes, tallies and results
//! - `tally.rs` - Threshold evaluation with early termination
//! - `voter.rs` - Vote request handler and vote collection
//! - `manager.rs` - Registry and dispatcher
//! - `algorithms/` - Individual consensus algorithm implementations
//!   - `quorum.rs` - Threshold voting over non-abstaining votes
//!   - `weighted.rs` - Weighted voting with expert presets
//!   - `raft/` - Leader election and log replication
//! - `tests.rs` - Unit tests

// Re-export public API
pub use algorithms::Algorithm;
pub use manager::{ConsensusManager, ConsensusMetrics};
pub use traits::ConsensusAlgorithm;
pub use types::{
    ConsensusRequest, ConsensusRequirements, ConsensusResult, Decision, Proposal, RequestConfig,
    Vote, VoteChoice, VoteTally,
};
pub use voter::voter_handler;

// Algorithm implementations
pub mod algorithms;
pub mod tally;
pub mod voter;

// Tests
#[cfg(test)]
#[path = "tests.rs"]
mod tests;

// Internal modules
mod manager;
mod traits;
mod types;
