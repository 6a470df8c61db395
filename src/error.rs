//! Error types shared by every coordination component

use crate::state::StateVersion;
use crate::types::AgentId;
use std::time::Duration;
use thiserror::Error;

/// Synchronous configuration and input failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unknown consensus algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Participant set is empty")]
    InvalidParticipants,

    #[error("Invalid weight {weight} for agent {agent}")]
    InvalidWeight { agent: AgentId, weight: f64 },

    #[error("Threshold {0} is outside (0, 1]")]
    InvalidThreshold(f64),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Cannot resolve an empty set of versions")]
    EmptyVersionSet,

    #[error("Cannot merge CRDT variant {left} with {right}")]
    CrdtMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("Invalid configuration in {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
}

/// Persistence failures reported by a [`crate::storage::Storage`] backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Sqlite(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Failures raised by a [`crate::network::Transport`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(AgentId),

    #[error("Peer {peer} rejected message: {reason}")]
    Rejected { peer: AgentId, reason: String },
}

/// Runtime error taxonomy for consensus, gossip and synchronization
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("No quorum: {reason}")]
    NoQuorum { reason: String },

    #[error("Not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<AgentId> },

    #[error("Deadline exceeded after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Peer {0} is unreachable")]
    PeerUnreachable(AgentId),

    #[error("Concurrent versions of {key:?} cannot be reconciled")]
    Conflict {
        key: Option<String>,
        versions: Vec<StateVersion>,
    },

    #[error("Gossip reached only {ratio:.2} convergence after {rounds} rounds")]
    ConvergenceTimeout { ratio: f64, rounds: usize },

    #[error("Internal consistency fault: {0}")]
    InvariantViolation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<TransportError> for ConsensusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(peer) => ConsensusError::PeerUnreachable(peer),
            TransportError::Rejected { peer, .. } => ConsensusError::PeerUnreachable(peer),
        }
    }
}

impl ConsensusError {
    pub fn no_quorum(reason: impl Into<String>) -> Self {
        ConsensusError::NoQuorum {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConsensusError::Timeout { .. }
                | ConsensusError::PeerUnreachable(_)
                | ConsensusError::NotLeader { .. }
                | ConsensusError::ConvergenceTimeout { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::InvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
