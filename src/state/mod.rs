//! Replicated state: version vectors, state versions and replica snapshots
//!
//! ## Structure
//! - `crdt.rs` - Counter / Set / Map CRDT variants
//! - `resolver.rs` - Conflict resolution strategies
//! - `replica.rs` - Keyed replica state shared by gossip and sync

pub mod crdt;
pub mod replica;
pub mod resolver;

pub use crdt::CrdtValue;
pub use replica::{MergeReport, ReplicaState};
pub use resolver::{ConflictResolver, FallbackStrategy, ResolutionStrategy};

use crate::types::{AgentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Causal relationship between two version vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    Dominates,
    DominatedBy,
    Concurrent,
}

/// Per-agent monotonically increasing counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<AgentId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent: &str) -> u64 {
        self.0.get(agent).copied().unwrap_or(0)
    }

    /// Bump the counter owned by `agent` and return its new value
    pub fn increment(&mut self, agent: &str) -> u64 {
        let counter = self.0.entry(agent.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Raise a component; counters never decrease
    pub fn observe(&mut self, agent: &str, counter: u64) {
        let current = self.0.entry(agent.to_string()).or_insert(0);
        *current = (*current).max(counter);
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VersionVector) {
        for (agent, counter) in &other.0 {
            self.observe(agent, *counter);
        }
    }

    pub fn merged(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn compare(&self, other: &VersionVector) -> Causality {
        let mut greater = false;
        let mut less = false;
        for agent in self.0.keys().chain(other.0.keys()) {
            match self.get(agent).cmp(&other.get(agent)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
        }
        match (greater, less) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Dominates,
            (false, true) => Causality::DominatedBy,
            (true, true) => Causality::Concurrent,
        }
    }

    /// A[i] >= B[i] for every i and A[j] > B[j] for some j
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == Causality::Dominates
    }

    /// True when every component is <= the matching component of `other`
    pub fn is_covered_by(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            Causality::Equal | Causality::DominatedBy
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VersionVector {
    fn from(entries: [(&str, u64); N]) -> Self {
        VersionVector(
            entries
                .into_iter()
                .map(|(agent, counter)| (agent.to_string(), counter))
                .collect(),
        )
    }
}

/// Content carried by a state version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// Opaque application value, resolved by LWW or causality
    Value(serde_json::Value),
    /// Convergent value merged by variant
    Crdt(CrdtValue),
}

/// One agent's version of a piece of shared state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersion {
    pub owner: AgentId,
    pub vector: VersionVector,
    pub timestamp: Timestamp,
    pub payload: Payload,
}

impl StateVersion {
    pub fn new(owner: impl Into<AgentId>, timestamp: Timestamp, payload: Payload) -> Self {
        let owner = owner.into();
        let mut vector = VersionVector::new();
        vector.increment(&owner);
        Self {
            owner,
            vector,
            timestamp,
            payload,
        }
    }

    pub fn with_vector(mut self, vector: VersionVector) -> Self {
        self.vector = vector;
        self
    }

    /// LWW ordering key; owner id breaks timestamp ties
    pub fn lww_key(&self) -> (Timestamp, &str) {
        (self.timestamp, self.owner.as_str())
    }
}
