//! Deterministic conflict resolution over divergent state versions

use super::{Causality, Payload, StateVersion, VersionVector};
use crate::error::{ConsensusError, Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Secondary strategy used when version vectors are concurrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackStrategy {
    LastWriteWins,
    Crdt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Greatest `(timestamp, owner)` wins
    LastWriteWins,
    /// Causal dominance, with an optional fallback for concurrent versions
    VersionVector { fallback: Option<FallbackStrategy> },
    /// Variant-wise CRDT join
    Crdt,
}

impl Default for ResolutionStrategy {
    fn default() -> Self {
        ResolutionStrategy::VersionVector {
            fallback: Some(FallbackStrategy::LastWriteWins),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ResolutionStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self { strategy }
    }

    pub fn last_write_wins() -> Self {
        Self::new(ResolutionStrategy::LastWriteWins)
    }

    pub fn crdt() -> Self {
        Self::new(ResolutionStrategy::Crdt)
    }

    pub fn version_vector(fallback: Option<FallbackStrategy>) -> Self {
        Self::new(ResolutionStrategy::VersionVector { fallback })
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    /// Merge a set of versions into one.
    ///
    /// The result does not depend on input order, and resolving a version
    /// with itself returns it unchanged.
    pub fn resolve(&self, versions: &[StateVersion]) -> Result<StateVersion> {
        if versions.is_empty() {
            return Err(ValidationError::EmptyVersionSet.into());
        }
        if versions.len() == 1 {
            return Ok(versions[0].clone());
        }
        match self.strategy {
            ResolutionStrategy::LastWriteWins => Ok(last_write_wins(versions).clone()),
            ResolutionStrategy::Crdt => crdt_join(versions),
            ResolutionStrategy::VersionVector { fallback } => by_causality(versions, fallback),
        }
    }
}

/// Total order: `(timestamp, owner)` first, then the canonical encoding so
/// identical keys with different content still pick the same winner everywhere
fn lww_order(a: &StateVersion, b: &StateVersion) -> Ordering {
    a.lww_key()
        .cmp(&b.lww_key())
        .then_with(|| canonical(a).cmp(&canonical(b)))
}

fn canonical(version: &StateVersion) -> String {
    serde_json::to_string(&(&version.payload, &version.vector)).unwrap_or_default()
}

fn last_write_wins(versions: &[StateVersion]) -> &StateVersion {
    let mut winner = &versions[0];
    for candidate in &versions[1..] {
        if lww_order(candidate, winner) == Ordering::Greater {
            winner = candidate;
        }
    }
    winner
}

fn joined_vector(versions: &[StateVersion]) -> VersionVector {
    versions
        .iter()
        .fold(VersionVector::new(), |acc, v| acc.merged(&v.vector))
}

fn payload_kind(payload: &Payload) -> &'static str {
    match payload {
        Payload::Crdt(value) => value.variant(),
        Payload::Value(_) => "value",
    }
}

fn crdt_join(versions: &[StateVersion]) -> Result<StateVersion> {
    if versions.iter().any(|v| matches!(v.payload, Payload::Value(_))) {
        let right = versions
            .iter()
            .map(|v| payload_kind(&v.payload))
            .find(|kind| *kind != "value")
            .unwrap_or("value");
        return Err(ValidationError::CrdtMismatch { left: "value", right }.into());
    }
    let mut values = versions.iter().filter_map(|v| match &v.payload {
        Payload::Crdt(value) => Some(value),
        Payload::Value(_) => None,
    });
    let Some(first) = values.next() else {
        return Err(ValidationError::EmptyVersionSet.into());
    };
    let mut merged = first.clone();
    for value in values {
        merged = merged.merge(value)?;
    }
    let latest = last_write_wins(versions);
    Ok(StateVersion {
        owner: latest.owner.clone(),
        vector: joined_vector(versions),
        timestamp: latest.timestamp,
        payload: Payload::Crdt(merged),
    })
}

fn by_causality(
    versions: &[StateVersion],
    fallback: Option<FallbackStrategy>,
) -> Result<StateVersion> {
    // Versions not strictly dominated by any other input
    let mut frontier: Vec<&StateVersion> = Vec::new();
    for candidate in versions {
        let dominated = versions
            .iter()
            .any(|other| other.vector.compare(&candidate.vector) == Causality::Dominates);
        if !dominated {
            frontier.push(candidate);
        }
    }

    let concurrent: Vec<StateVersion> = frontier.into_iter().cloned().collect();
    let first = &concurrent[0];
    if concurrent.iter().all(|v| v == first) {
        return Ok(first.clone());
    }
    // Same causal history and content, differing only in metadata
    if concurrent
        .iter()
        .all(|v| v.vector == first.vector && v.payload == first.payload)
    {
        return Ok(last_write_wins(&concurrent).clone());
    }

    match fallback {
        Some(FallbackStrategy::LastWriteWins) => {
            let winner = last_write_wins(&concurrent);
            Ok(StateVersion {
                vector: joined_vector(versions),
                ..winner.clone()
            })
        }
        Some(FallbackStrategy::Crdt) => {
            let joined = crdt_join(&concurrent)?;
            Ok(StateVersion {
                vector: joined_vector(versions),
                ..joined
            })
        }
        None => Err(ConsensusError::Conflict {
            key: None,
            versions: concurrent,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::crdt::{Counter, CrdtValue};
    use proptest::prelude::*;
    use serde_json::json;

    fn value_version(owner: &str, ts: i64, vector: VersionVector, value: serde_json::Value) -> StateVersion {
        StateVersion::new(owner, ts, Payload::Value(value)).with_vector(vector)
    }

    #[test]
    fn test_lww_picks_latest_timestamp() {
        let resolver = ConflictResolver::last_write_wins();
        let a = value_version("a", 10, VersionVector::from([("a", 1)]), json!("old"));
        let b = value_version("b", 20, VersionVector::from([("b", 1)]), json!("new"));
        let merged = resolver.resolve(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(merged, b);
        assert_eq!(resolver.resolve(&[b, a]).unwrap().payload, Payload::Value(json!("new")));
    }

    #[test]
    fn test_lww_breaks_ties_by_owner() {
        let resolver = ConflictResolver::last_write_wins();
        let a = value_version("agent-a", 10, VersionVector::from([("agent-a", 1)]), json!(1));
        let b = value_version("agent-b", 10, VersionVector::from([("agent-b", 1)]), json!(2));
        assert_eq!(resolver.resolve(&[a.clone(), b.clone()]).unwrap().owner, "agent-b");
        assert_eq!(resolver.resolve(&[b, a]).unwrap().owner, "agent-b");
    }

    #[test]
    fn test_dominating_version_wins_regardless_of_timestamp() {
        let resolver = ConflictResolver::version_vector(None);
        let newer = value_version("a", 5, VersionVector::from([("a", 2), ("b", 1)]), json!("causal"));
        let older = value_version("b", 50, VersionVector::from([("a", 1), ("b", 1)]), json!("stale"));
        let merged = resolver.resolve(&[older, newer.clone()]).unwrap();
        assert_eq!(merged, newer);
    }

    #[test]
    fn test_concurrent_without_fallback_is_conflict() {
        let resolver = ConflictResolver::version_vector(None);
        let a = value_version("a", 1, VersionVector::from([("a", 1)]), json!("x"));
        let b = value_version("b", 2, VersionVector::from([("b", 1)]), json!("y"));
        match resolver.resolve(&[a.clone(), b.clone()]) {
            Err(ConsensusError::Conflict { versions, .. }) => {
                assert_eq!(versions.len(), 2);
                assert!(versions.contains(&a));
                assert!(versions.contains(&b));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_with_lww_fallback_joins_vectors() {
        let resolver = ConflictResolver::version_vector(Some(FallbackStrategy::LastWriteWins));
        let a = value_version("a", 1, VersionVector::from([("a", 1)]), json!("x"));
        let b = value_version("b", 2, VersionVector::from([("b", 1)]), json!("y"));
        let merged = resolver.resolve(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(merged.payload, Payload::Value(json!("y")));
        assert!(merged.vector.dominates(&a.vector));
        assert!(merged.vector.dominates(&b.vector));
        assert_eq!(resolver.resolve(&[b, a]).unwrap(), merged);
    }

    #[test]
    fn test_crdt_strategy_merges_counters() {
        let resolver = ConflictResolver::crdt();
        let mut left = Counter::new();
        left.increment("a", 3);
        let mut right = Counter::new();
        right.increment("b", 4);
        let a = StateVersion::new("a", 1, Payload::Crdt(CrdtValue::Counter(left)));
        let b = StateVersion::new("b", 2, Payload::Crdt(CrdtValue::Counter(right)));
        let merged = resolver.resolve(&[a, b]).unwrap();
        match merged.payload {
            Payload::Crdt(CrdtValue::Counter(c)) => assert_eq!(c.value(), 7),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_crdt_strategy_rejects_plain_values() {
        let resolver = ConflictResolver::crdt();
        let a = StateVersion::new("a", 1, Payload::Value(json!(1)));
        let b = StateVersion::new("b", 1, Payload::Value(json!(2)));
        assert_eq!(
            resolver.resolve(&[a, b]),
            Err(ConsensusError::Validation(ValidationError::CrdtMismatch {
                left: "value",
                right: "value",
            }))
        );
    }

    #[test]
    fn test_crdt_strategy_names_mixed_payloads() {
        let resolver = ConflictResolver::crdt();
        let a = StateVersion::new("a", 1, Payload::Crdt(CrdtValue::Counter(Counter::new())));
        let b = StateVersion::new("b", 2, Payload::Value(json!(2)));
        let err = resolver.resolve(&[a, b]).unwrap_err();
        assert_eq!(
            err,
            ConsensusError::Validation(ValidationError::CrdtMismatch {
                left: "value",
                right: "counter",
            })
        );
        assert_eq!(err.to_string(), "Validation failed: Cannot merge CRDT variant value with counter");
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.resolve(&[]),
            Err(ConsensusError::Validation(ValidationError::EmptyVersionSet))
        );
    }

    fn arb_version() -> impl Strategy<Value = StateVersion> {
        (
            prop_oneof![Just("a"), Just("b"), Just("c")],
            0i64..20,
            0i64..5,
        )
            .prop_map(|(owner, ts, value)| {
                value_version(owner, ts, VersionVector::from([(owner, 1)]), json!(value))
            })
    }

    proptest! {
        #[test]
        fn lww_is_order_independent(a in arb_version(), b in arb_version(), c in arb_version()) {
            let resolver = ConflictResolver::last_write_wins();
            let ab = resolver.resolve(&[a.clone(), b.clone()]).unwrap();
            let left = resolver.resolve(&[ab, c.clone()]).unwrap();
            let bc = resolver.resolve(&[b.clone(), c.clone()]).unwrap();
            let right = resolver.resolve(&[a.clone(), bc]).unwrap();
            prop_assert_eq!(left, right);
            prop_assert_eq!(resolver.resolve(&[a.clone(), a.clone()]).unwrap(), a);
        }
    }
}
