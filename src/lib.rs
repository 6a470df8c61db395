//! Coordination primitives for agent swarms
//!
//! - [`consensus`] - pluggable agreement algorithms behind a manager
//! - [`gossip`] - epidemic dissemination of replica state
//! - [`state`] - version vectors, CRDTs and conflict resolution
//! - [`synchronizer`] - pairwise full and delta state sync
//!
//! All protocols talk through [`network::Transport`] and persist through
//! [`storage::Storage`], so they run unchanged over the in-process
//! [`network::sim::SimulatedNetwork`].

pub mod config;
pub mod consensus;
pub mod error;
pub mod gossip;
pub mod logger;
pub mod network;
pub mod state;
pub mod storage;
pub mod synchronizer;
pub mod types;

pub use config::SwarmConfig;
pub use consensus::algorithms::{QuorumConsensus, RaftConsensus, WeightedConsensus};
pub use consensus::{Algorithm, ConsensusManager, ConsensusResult, Proposal};
pub use error::{ConsensusError, Result, ValidationError};
pub use gossip::{GossipNode, GossipProtocol, GossipReport};
pub use state::{ConflictResolver, ReplicaState, StateVersion, VersionVector};
pub use synchronizer::{StateSynchronizer, SyncMode, SyncResult};
pub use types::{Agent, AgentId};
