//! Persistence collaborator interface
//!
//! Raft nodes persist their hard state and log through [`Storage`] so a
//! restarted node resumes with the same term, vote and entries. The state
//! synchronizer keeps per-peer checkpoints and merged snapshots here too.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::consensus::algorithms::raft::{LogEntry, LogIndex, Term};
use crate::error::StorageError;
use crate::state::{ReplicaState, VersionVector};
use crate::types::AgentId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type StorageResult<T> = Result<T, StorageError>;

/// Raft state that must survive a restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<AgentId>,
}

pub trait Storage: Send + Sync {
    fn load_hard_state(&self, node: &str) -> StorageResult<Option<HardState>>;
    fn save_hard_state(&self, node: &str, state: &HardState) -> StorageResult<()>;

    fn append_entries(&self, node: &str, entries: &[LogEntry]) -> StorageResult<()>;
    /// Remove entries at `from` and after
    fn truncate_log(&self, node: &str, from: LogIndex) -> StorageResult<()>;
    fn load_log(&self, node: &str) -> StorageResult<Vec<LogEntry>>;

    fn save_checkpoint(&self, owner: &str, peer: &str, vector: &VersionVector)
        -> StorageResult<()>;
    fn load_checkpoint(&self, owner: &str, peer: &str) -> StorageResult<Option<VersionVector>>;

    fn save_snapshot(&self, state: &ReplicaState) -> StorageResult<()>;
    fn load_snapshot(&self, owner: &str) -> StorageResult<Option<ReplicaState>>;
}

#[derive(Default)]
struct MemoryInner {
    hard_states: HashMap<AgentId, HardState>,
    logs: HashMap<AgentId, Vec<LogEntry>>,
    checkpoints: HashMap<(AgentId, AgentId), VersionVector>,
    snapshots: HashMap<AgentId, ReplicaState>,
}

/// Volatile storage for tests and single-process simulations
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load_hard_state(&self, node: &str) -> StorageResult<Option<HardState>> {
        Ok(self.inner.read().hard_states.get(node).cloned())
    }

    fn save_hard_state(&self, node: &str, state: &HardState) -> StorageResult<()> {
        self.inner
            .write()
            .hard_states
            .insert(node.to_string(), state.clone());
        Ok(())
    }

    fn append_entries(&self, node: &str, entries: &[LogEntry]) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let log = inner.logs.entry(node.to_string()).or_default();
        for entry in entries {
            log.retain(|existing| existing.index != entry.index);
            log.push(entry.clone());
        }
        log.sort_by_key(|e| e.index);
        Ok(())
    }

    fn truncate_log(&self, node: &str, from: LogIndex) -> StorageResult<()> {
        if let Some(log) = self.inner.write().logs.get_mut(node) {
            log.retain(|e| e.index < from);
        }
        Ok(())
    }

    fn load_log(&self, node: &str) -> StorageResult<Vec<LogEntry>> {
        Ok(self.inner.read().logs.get(node).cloned().unwrap_or_default())
    }

    fn save_checkpoint(
        &self,
        owner: &str,
        peer: &str,
        vector: &VersionVector,
    ) -> StorageResult<()> {
        self.inner
            .write()
            .checkpoints
            .insert((owner.to_string(), peer.to_string()), vector.clone());
        Ok(())
    }

    fn load_checkpoint(&self, owner: &str, peer: &str) -> StorageResult<Option<VersionVector>> {
        Ok(self
            .inner
            .read()
            .checkpoints
            .get(&(owner.to_string(), peer.to_string()))
            .cloned())
    }

    fn save_snapshot(&self, state: &ReplicaState) -> StorageResult<()> {
        self.inner
            .write()
            .snapshots
            .insert(state.owner.clone(), state.clone());
        Ok(())
    }

    fn load_snapshot(&self, owner: &str) -> StorageResult<Option<ReplicaState>> {
        Ok(self.inner.read().snapshots.get(owner).cloned())
    }
}
