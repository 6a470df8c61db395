//! Convergent replicated data types
//!
//! Every variant's merge is a join: commutative, associative and idempotent.

use crate::error::ValidationError;
use crate::types::{AgentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Grow-only counter keyed by agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    counts: BTreeMap<AgentId, u64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, agent: &str, by: u64) {
        *self.counts.entry(agent.to_string()).or_insert(0) += by;
    }

    pub fn get(&self, agent: &str) -> u64 {
        self.counts.get(agent).copied().unwrap_or(0)
    }

    /// Sum across agents
    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Per-agent maximum; never double-counts a partial view
    pub fn merge(&self, other: &Counter) -> Counter {
        let mut counts = self.counts.clone();
        for (agent, count) in &other.counts {
            let entry = counts.entry(agent.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
        Counter { counts }
    }
}

/// Observed-remove set with timestamped adds and remove tombstones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrSet {
    adds: BTreeMap<String, Timestamp>,
    removes: BTreeMap<String, Timestamp>,
}

impl OrSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: impl Into<String>, at: Timestamp) {
        let entry = self.adds.entry(element.into()).or_insert(at);
        *entry = (*entry).max(at);
    }

    pub fn remove(&mut self, element: impl Into<String>, at: Timestamp) {
        let entry = self.removes.entry(element.into()).or_insert(at);
        *entry = (*entry).max(at);
    }

    /// Present unless the latest tombstone is strictly newer than the latest add
    pub fn contains(&self, element: &str) -> bool {
        match (self.adds.get(element), self.removes.get(element)) {
            (Some(added), Some(removed)) => removed <= added,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn elements(&self) -> BTreeSet<String> {
        self.adds
            .keys()
            .filter(|element| self.contains(element))
            .cloned()
            .collect()
    }

    pub fn merge(&self, other: &OrSet) -> OrSet {
        OrSet {
            adds: max_timestamps(&self.adds, &other.adds),
            removes: max_timestamps(&self.removes, &other.removes),
        }
    }
}

fn max_timestamps(
    left: &BTreeMap<String, Timestamp>,
    right: &BTreeMap<String, Timestamp>,
) -> BTreeMap<String, Timestamp> {
    let mut out = left.clone();
    for (element, at) in right {
        let entry = out.entry(element.clone()).or_insert(*at);
        *entry = (*entry).max(*at);
    }
    out
}

/// Map of keys to nested CRDT values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdtMap {
    entries: BTreeMap<String, CrdtValue>,
}

impl CrdtMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: CrdtValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&CrdtValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(&self, other: &CrdtMap) -> Result<CrdtMap, ValidationError> {
        let mut entries = self.entries.clone();
        for (key, value) in &other.entries {
            let merged = match entries.get(key) {
                Some(existing) => existing.merge(value)?,
                None => value.clone(),
            };
            entries.insert(key.clone(), merged);
        }
        Ok(CrdtMap { entries })
    }
}

/// Closed set of CRDT variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum CrdtValue {
    Counter(Counter),
    Set(OrSet),
    Map(CrdtMap),
}

impl CrdtValue {
    pub fn variant(&self) -> &'static str {
        match self {
            CrdtValue::Counter(_) => "counter",
            CrdtValue::Set(_) => "set",
            CrdtValue::Map(_) => "map",
        }
    }

    /// Merge two values of the same variant
    pub fn merge(&self, other: &CrdtValue) -> Result<CrdtValue, ValidationError> {
        match (self, other) {
            (CrdtValue::Counter(a), CrdtValue::Counter(b)) => Ok(CrdtValue::Counter(a.merge(b))),
            (CrdtValue::Set(a), CrdtValue::Set(b)) => Ok(CrdtValue::Set(a.merge(b))),
            (CrdtValue::Map(a), CrdtValue::Map(b)) => Ok(CrdtValue::Map(a.merge(b)?)),
            (left, right) => Err(ValidationError::CrdtMismatch {
                left: left.variant(),
                right: right.variant(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn counter(entries: &[(&str, u64)]) -> Counter {
        let mut c = Counter::new();
        for (agent, by) in entries {
            c.increment(agent, *by);
        }
        c
    }

    #[test]
    fn test_counter_merge_takes_per_agent_max() {
        let a = counter(&[("a", 3), ("b", 1)]);
        let b = counter(&[("a", 2), ("b", 4), ("c", 1)]);
        let merged = a.merge(&b);
        assert_eq!(merged.get("a"), 3);
        assert_eq!(merged.get("b"), 4);
        assert_eq!(merged.value(), 8);
        // Re-merging a partial view does not double count
        assert_eq!(merged.merge(&a).value(), 8);
    }

    #[test]
    fn test_or_set_tombstone_semantics() {
        let mut replica_a = OrSet::new();
        replica_a.add("x", 10);
        replica_a.add("y", 10);

        let mut replica_b = replica_a.clone();
        replica_b.remove("x", 20);
        // Concurrent re-add newer than the tombstone survives
        replica_a.remove("y", 15);
        replica_a.add("y", 30);

        let merged = replica_a.merge(&replica_b);
        assert!(!merged.contains("x"));
        assert!(merged.contains("y"));
        assert_eq!(merged, replica_b.merge(&replica_a));
    }

    #[test]
    fn test_or_set_equal_timestamps_keep_element() {
        let mut set = OrSet::new();
        set.add("x", 5);
        set.remove("x", 5);
        assert!(set.contains("x"));
    }

    #[test]
    fn test_map_merges_per_key() {
        let mut left = CrdtMap::new();
        left.insert("hits", CrdtValue::Counter(counter(&[("a", 2)])));
        let mut right = CrdtMap::new();
        right.insert("hits", CrdtValue::Counter(counter(&[("b", 5)])));
        let mut tags = OrSet::new();
        tags.add("red", 1);
        right.insert("tags", CrdtValue::Set(tags));

        let merged = left.merge(&right).unwrap();
        assert_eq!(merged.len(), 2);
        match merged.get("hits") {
            Some(CrdtValue::Counter(c)) => assert_eq!(c.value(), 7),
            other => panic!("unexpected hits value: {:?}", other),
        }
    }

    #[test]
    fn test_variant_mismatch_is_rejected() {
        let a = CrdtValue::Counter(Counter::new());
        let b = CrdtValue::Set(OrSet::new());
        assert_eq!(
            a.merge(&b),
            Err(ValidationError::CrdtMismatch {
                left: "counter",
                right: "set"
            })
        );
    }

    fn arb_counter() -> impl Strategy<Value = Counter> {
        prop::collection::btree_map("[a-e]", 0u64..100, 0..5).prop_map(|counts| Counter { counts })
    }

    fn arb_set() -> impl Strategy<Value = OrSet> {
        (
            prop::collection::btree_map("[p-u]", 0i64..50, 0..5),
            prop::collection::btree_map("[p-u]", 0i64..50, 0..5),
        )
            .prop_map(|(adds, removes)| OrSet { adds, removes })
    }

    fn arb_map() -> impl Strategy<Value = CrdtMap> {
        prop::collection::btree_map(
            prop_oneof![Just("c1".to_string()), Just("c2".to_string())],
            arb_counter().prop_map(CrdtValue::Counter),
            0..3,
        )
        .prop_map(|entries| CrdtMap { entries })
    }

    proptest! {
        #[test]
        fn counter_merge_commutative(a in arb_counter(), b in arb_counter()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn counter_merge_associative(a in arb_counter(), b in arb_counter(), c in arb_counter()) {
            prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        }

        #[test]
        fn counter_merge_idempotent(a in arb_counter()) {
            prop_assert_eq!(a.merge(&a), a);
        }

        #[test]
        fn set_merge_is_a_join(a in arb_set(), b in arb_set(), c in arb_set()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
            prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
            prop_assert_eq!(a.merge(&a), a.clone());
        }

        #[test]
        fn map_merge_is_a_join(a in arb_map(), b in arb_map(), c in arb_map()) {
            prop_assert_eq!(a.merge(&b).unwrap(), b.merge(&a).unwrap());
            prop_assert_eq!(
                a.merge(&b).unwrap().merge(&c).unwrap(),
                a.merge(&b.merge(&c).unwrap()).unwrap()
            );
            prop_assert_eq!(a.merge(&a).unwrap(), a.clone());
        }
    }
}
