//! Keyed replica of shared state owned by one agent

use super::{ConflictResolver, Payload, StateVersion, VersionVector};
use crate::error::ConsensusError;
use crate::types::{now_millis, AgentId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub owner: AgentId,
    entries: BTreeMap<String, StateVersion>,
    /// Highest owner component ever issued or observed; never decreases
    #[serde(default)]
    clock: u64,
}

/// Outcome of merging remote entries into a replica
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Keys whose local version changed
    pub updated: Vec<String>,
    /// Keys left untouched because their versions could not be reconciled
    pub conflicts: Vec<String>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.updated.is_empty()
    }
}

impl ReplicaState {
    pub fn new(owner: impl Into<AgentId>) -> Self {
        Self {
            owner: owner.into(),
            entries: BTreeMap::new(),
            clock: 0,
        }
    }

    /// Write a local value, advancing this owner's vector component.
    ///
    /// The owner's component comes from a replica-wide clock that survives
    /// its entries being replaced by remote versions, so every local write
    /// escapes any checkpoint taken before it. The timestamp never goes
    /// backwards relative to the previous version, so LWW ordering agrees
    /// with causal order for local writes.
    pub fn put(&mut self, key: impl Into<String>, payload: Payload) -> &StateVersion {
        let key = key.into();
        let next = self.clock.max(self.owner_counter()) + 1;
        self.clock = next;
        let (mut vector, floor) = match self.entries.get(&key) {
            Some(previous) => (previous.vector.clone(), previous.timestamp + 1),
            None => (VersionVector::new(), i64::MIN),
        };
        vector.observe(&self.owner, next);
        let version = StateVersion {
            owner: self.owner.clone(),
            vector,
            timestamp: now_millis().max(floor),
            payload,
        };
        self.entries.insert(key.clone(), version);
        &self.entries[&key]
    }

    fn owner_counter(&self) -> u64 {
        self.entries
            .values()
            .map(|version| version.vector.get(&self.owner))
            .max()
            .unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<&StateVersion> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, StateVersion> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pointwise maximum over every entry's vector
    pub fn vector(&self) -> VersionVector {
        self.entries
            .values()
            .fold(VersionVector::new(), |acc, v| acc.merged(&v.vector))
    }

    /// Entries that carry a vector component newer than `checkpoint`
    pub fn changed_since(&self, checkpoint: &VersionVector) -> BTreeMap<String, StateVersion> {
        self.entries
            .iter()
            .filter(|(_, version)| !version.vector.is_covered_by(checkpoint))
            .map(|(key, version)| (key.clone(), version.clone()))
            .collect()
    }

    /// Merge remote entries key by key through `resolver`
    pub fn merge_entries(
        &mut self,
        incoming: &BTreeMap<String, StateVersion>,
        resolver: &ConflictResolver,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        for (key, remote) in incoming {
            self.clock = self.clock.max(remote.vector.get(&self.owner));
            let merged = match self.entries.get(key) {
                None => Ok(remote.clone()),
                Some(local) if local == remote => continue,
                Some(local) => resolver.resolve(&[local.clone(), remote.clone()]),
            };
            match merged {
                Ok(version) => {
                    if self.entries.get(key) != Some(&version) {
                        self.entries.insert(key.clone(), version);
                        report.updated.push(key.clone());
                    }
                }
                Err(ConsensusError::Conflict { .. }) => report.conflicts.push(key.clone()),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "Replica: failed to merge entry");
                    report.conflicts.push(key.clone());
                }
            }
        }
        report
    }

    /// SHA-256 over the canonical JSON encoding of the entries
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_string(&self.entries).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(encoded);
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FallbackStrategy;
    use serde_json::json;

    #[test]
    fn test_put_advances_vector_and_timestamp() {
        let mut replica = ReplicaState::new("a");
        let first = replica.put("k", Payload::Value(json!(1))).clone();
        let second = replica.put("k", Payload::Value(json!(2))).clone();
        assert!(second.vector.dominates(&first.vector));
        assert!(second.timestamp > first.timestamp);
        assert_eq!(replica.vector().get("a"), 2);
    }

    #[test]
    fn test_changed_since_checkpoint() {
        let mut replica = ReplicaState::new("a");
        replica.put("x", Payload::Value(json!(1)));
        let checkpoint = replica.vector();
        assert!(replica.changed_since(&checkpoint).is_empty());

        replica.put("y", Payload::Value(json!(2)));
        let delta = replica.changed_since(&checkpoint);
        assert_eq!(delta.len(), 1);
        assert!(delta.contains_key("y"));
        assert_eq!(replica.vector().get("a"), 2);
    }

    #[test]
    fn test_merge_converges_digests() {
        let resolver = ConflictResolver::version_vector(Some(FallbackStrategy::LastWriteWins));
        let mut a = ReplicaState::new("a");
        let mut b = ReplicaState::new("b");
        a.put("shared", Payload::Value(json!("from-a")));
        b.put("shared", Payload::Value(json!("from-b")));
        b.put("only-b", Payload::Value(json!(true)));

        let a_entries = a.entries().clone();
        let b_entries = b.entries().clone();
        let report_a = a.merge_entries(&b_entries, &resolver);
        b.merge_entries(&a_entries, &resolver);

        assert!(report_a.changed());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_conflicting_keys_are_reported_and_kept() {
        let resolver = ConflictResolver::version_vector(None);
        let mut a = ReplicaState::new("a");
        let mut b = ReplicaState::new("b");
        a.put("k", Payload::Value(json!(1)));
        b.put("k", Payload::Value(json!(2)));
        let before = a.get("k").cloned();

        let report = a.merge_entries(b.entries(), &resolver);
        assert_eq!(report.conflicts, vec!["k".to_string()]);
        assert_eq!(a.get("k").cloned(), before);
    }

    #[test]
    fn test_owner_clock_survives_replaced_entry() {
        let resolver = ConflictResolver::last_write_wins();
        let mut a = ReplicaState::new("a");
        a.put("k", Payload::Value(json!("local")));
        let checkpoint = a.vector();

        let mut remote = StateVersion {
            owner: "c".to_string(),
            vector: VersionVector::new(),
            timestamp: a.get("k").map(|v| v.timestamp + 1000).unwrap_or_default(),
            payload: Payload::Value(json!("remote")),
        };
        remote.vector.observe("c", 1);
        let incoming = BTreeMap::from([("k".to_string(), remote.clone())]);
        assert!(a.merge_entries(&incoming, &resolver).changed());
        assert_eq!(a.get("k"), Some(&remote));
        assert_eq!(a.vector().get("a"), 0);

        let next = a.put("k2", Payload::Value(json!(2))).clone();
        assert_eq!(next.vector.get("a"), 2);
        assert!(a.changed_since(&checkpoint).contains_key("k2"));
    }

    #[test]
    fn test_owner_clock_catches_up_with_observed_versions() {
        let resolver = ConflictResolver::version_vector(Some(FallbackStrategy::LastWriteWins));
        let mut a = ReplicaState::new("a");
        let mut echoed = VersionVector::new();
        echoed.observe("a", 5);
        let version = StateVersion {
            owner: "a".to_string(),
            vector: echoed,
            timestamp: now_millis(),
            payload: Payload::Value(json!("restored")),
        };
        a.merge_entries(&BTreeMap::from([("old".to_string(), version)]), &resolver);

        assert_eq!(a.put("new", Payload::Value(json!(1))).vector.get("a"), 6);
    }

    #[test]
    fn test_snapshot_keeps_owner_clock() {
        let mut a = ReplicaState::new("a");
        a.put("k", Payload::Value(json!(1)));
        a.put("k", Payload::Value(json!(2)));
        let restored: ReplicaState = serde_json::from_str(&serde_json::to_string(&a).unwrap()).unwrap();
        assert_eq!(restored, a);

        let mut restored = restored;
        assert_eq!(restored.put("j", Payload::Value(json!(3))).vector.get("a"), 3);
    }
}
