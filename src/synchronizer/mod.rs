//! Pairwise state synchronization between agents
//!
//! A round pushes local entries to one peer and merges whatever the peer
//! sends back. Delta rounds only ship entries whose version vector escapes
//! the checkpoint recorded after the previous round with that peer; full
//! rounds ship everything. Both sides record the checkpoint, so a repeated
//! delta round with no new writes moves nothing.
//!
//! A checkpoint only ever covers versions that actually crossed the wire
//! (or were already covered before the round). Local writes that land
//! while a round is in flight stay outside it and travel next time.

use crate::config::SyncConfig;
use crate::error::{ConsensusError, Result, TransportError};
use crate::network::{Message, NetworkHandler, Transport};
use crate::state::{ConflictResolver, MergeReport, Payload, ReplicaState, StateVersion, VersionVector};
use crate::storage::Storage;
use crate::types::{now_millis, AgentId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Ship the whole replica
    Full,
    /// Ship entries changed since the last checkpoint with the peer
    Delta,
}

/// Per-peer bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    pub peer: AgentId,
    pub round: u64,
    /// Local vector right after the last successful round
    pub checkpoint: VersionVector,
    pub last_synced: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub peer: AgentId,
    pub mode: SyncMode,
    pub round: u64,
    /// Entries shipped to the peer
    pub sent: usize,
    /// Entries received from the peer
    pub received: usize,
    pub updated: Vec<String>,
    pub conflicts: Vec<String>,
}

/// Notified after every merge, on both ends of a round
pub trait SyncListener: Send + Sync {
    fn on_merged(&self, state: &ReplicaState, result: &SyncResult);
}

/// Persists the merged replica after each round
pub struct SnapshotListener {
    storage: Arc<dyn Storage>,
}

impl SnapshotListener {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl SyncListener for SnapshotListener {
    fn on_merged(&self, state: &ReplicaState, result: &SyncResult) {
        if let Err(e) = self.storage.save_snapshot(state) {
            warn!(owner = %state.owner, peer = %result.peer, error = %e, "Sync: failed to persist snapshot");
        }
    }
}

/// State reachable from both the initiating side and the message handler
struct Shared {
    id: AgentId,
    state: RwLock<ReplicaState>,
    resolver: ConflictResolver,
    storage: Option<Arc<dyn Storage>>,
    listeners: RwLock<Vec<Arc<dyn SyncListener>>>,
    sessions: RwLock<HashMap<AgentId, SyncSession>>,
}

impl Shared {
    /// Session first, then storage, then nothing synced yet
    fn checkpoint(&self, peer: &AgentId) -> VersionVector {
        if let Some(session) = self.sessions.read().get(peer) {
            return session.checkpoint.clone();
        }
        let Some(storage) = &self.storage else {
            return VersionVector::new();
        };
        match storage.load_checkpoint(&self.id, peer) {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                warn!(agent = %self.id, peer = %peer, error = %e, "Sync: failed to load checkpoint");
                VersionVector::new()
            }
        }
    }

    fn next_round(&self, peer: &AgentId) -> u64 {
        self.sessions
            .read()
            .get(peer)
            .map(|session| session.round)
            .unwrap_or(0)
            + 1
    }

    /// Merge `incoming` and snapshot the result
    fn merge(&self, incoming: &BTreeMap<String, StateVersion>) -> (MergeReport, ReplicaState) {
        let mut state = self.state.write();
        let report = state.merge_entries(incoming, &self.resolver);
        (report, state.clone())
    }

    fn finish(&self, checkpoint: VersionVector, snapshot: &ReplicaState, result: &SyncResult) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_checkpoint(&self.id, &result.peer, &checkpoint) {
                warn!(agent = %self.id, peer = %result.peer, error = %e, "Sync: failed to persist checkpoint");
            }
        }
        self.sessions.write().insert(
            result.peer.clone(),
            SyncSession {
                peer: result.peer.clone(),
                round: result.round,
                checkpoint,
                last_synced: now_millis(),
            },
        );

        let listeners: Vec<Arc<dyn SyncListener>> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_merged(snapshot, result);
        }
    }
}

pub struct StateSynchronizer {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
}

impl StateSynchronizer {
    pub fn new(transport: Arc<dyn Transport>, resolver: ConflictResolver, config: SyncConfig) -> Self {
        let id = transport.local_id().clone();
        Self::build(ReplicaState::new(id), transport, resolver, config, None)
    }

    /// Synchronizer that persists checkpoints and resumes from the last
    /// stored snapshot of this agent
    pub fn with_storage(
        transport: Arc<dyn Transport>,
        resolver: ConflictResolver,
        config: SyncConfig,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let id = transport.local_id().clone();
        let state = match storage.load_snapshot(&id) {
            Ok(Some(snapshot)) => {
                info!(agent = %id, entries = snapshot.len(), "Sync: restored snapshot");
                snapshot
            }
            Ok(None) => ReplicaState::new(id),
            Err(e) => {
                warn!(agent = %id, error = %e, "Sync: failed to load snapshot, starting empty");
                ReplicaState::new(id)
            }
        };
        Self::build(state, transport, resolver, config, Some(storage))
    }

    fn build(
        state: ReplicaState,
        transport: Arc<dyn Transport>,
        resolver: ConflictResolver,
        config: SyncConfig,
        storage: Option<Arc<dyn Storage>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: transport.local_id().clone(),
                state: RwLock::new(state),
                resolver,
                storage,
                listeners: RwLock::new(Vec::new()),
                sessions: RwLock::new(HashMap::new()),
            }),
            transport,
            config,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.shared.id
    }

    pub fn add_listener(&self, listener: Arc<dyn SyncListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn put(&self, key: impl Into<String>, payload: Payload) -> StateVersion {
        self.shared.state.write().put(key, payload).clone()
    }

    pub fn state(&self) -> ReplicaState {
        self.shared.state.read().clone()
    }

    pub fn session(&self, peer: &str) -> Option<SyncSession> {
        self.shared.sessions.read().get(peer).cloned()
    }

    /// Synchronize with `peer` in the configured default mode
    pub async fn sync_default(&self, peer: &AgentId) -> Result<SyncResult> {
        self.sync(peer, self.config.default_mode).await
    }

    pub async fn sync(&self, peer: &AgentId, mode: SyncMode) -> Result<SyncResult> {
        self.sync_with_timeout(peer, mode, self.config.timeout).await
    }

    /// One synchronization round bounded by `timeout`.
    ///
    /// A round that times out or cannot reach the peer leaves local state,
    /// the session and the checkpoint untouched.
    pub async fn sync_with_timeout(
        &self,
        peer: &AgentId,
        mode: SyncMode,
        timeout: Duration,
    ) -> Result<SyncResult> {
        let round = self.shared.next_round(peer);
        let previous = self.shared.checkpoint(peer);
        // Vector and delta come from the same view of the replica
        let (outgoing, shipped) = {
            let state = self.shared.state.read();
            let outgoing = match mode {
                SyncMode::Full => state.entries().clone(),
                SyncMode::Delta => state.changed_since(&previous),
            };
            (outgoing, previous.merged(&state.vector()))
        };
        let sent = outgoing.len();
        debug!(agent = %self.shared.id, peer = %peer, ?mode, round, sent, "Sync: pushing");

        let push = Message::SyncPush {
            mode,
            round,
            known: previous,
            entries: outgoing,
        };
        let reply = match tokio::time::timeout(timeout, self.transport.send(peer, push)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(agent = %self.shared.id, peer = %peer, error = %e, "Sync: round aborted");
                return Err(e.into());
            }
            Err(_) => {
                warn!(agent = %self.shared.id, peer = %peer, timeout_ms = timeout.as_millis() as u64, "Sync: round timed out");
                return Err(ConsensusError::Timeout { elapsed: timeout });
            }
        };
        let incoming = match reply {
            Message::SyncReply { entries, .. } => entries,
            other => {
                return Err(TransportError::Rejected {
                    peer: peer.clone(),
                    reason: format!("unexpected {} during sync", other.kind()),
                }
                .into())
            }
        };

        let (report, snapshot) = self.shared.merge(&incoming);
        let checkpoint = covering(shipped, &incoming);
        let result = SyncResult {
            peer: peer.clone(),
            mode,
            round,
            sent,
            received: incoming.len(),
            updated: report.updated,
            conflicts: report.conflicts,
        };
        self.shared.finish(checkpoint, &snapshot, &result);
        info!(
            agent = %self.shared.id,
            peer = %peer,
            round,
            sent = result.sent,
            received = result.received,
            updated = result.updated.len(),
            "Sync: round complete"
        );
        Ok(result)
    }

    /// Handler answering sync pushes from peers
    pub fn handler(&self) -> NetworkHandler {
        let shared = Arc::clone(&self.shared);
        NetworkHandler::new(move |from, message| match message {
            Message::SyncPush {
                mode,
                round,
                known,
                entries,
            } => {
                // The pusher holds everything its checkpoint and its push cover
                let checkpoint = covering(shared.checkpoint(from).merged(&known), &entries);
                let (report, snapshot) = shared.merge(&entries);
                let reply: BTreeMap<String, StateVersion> = match mode {
                    SyncMode::Full => snapshot.entries().clone(),
                    SyncMode::Delta => snapshot
                        .changed_since(&known)
                        .into_iter()
                        .filter(|(key, version)| entries.get(key) != Some(version))
                        .collect(),
                };
                let result = SyncResult {
                    peer: from.clone(),
                    mode,
                    round,
                    sent: reply.len(),
                    received: entries.len(),
                    updated: report.updated,
                    conflicts: report.conflicts,
                };
                shared.finish(checkpoint, &snapshot, &result);
                debug!(agent = %shared.id, peer = %from, round, received = result.received, sent = result.sent, "Sync: answered push");
                Ok(Message::SyncReply {
                    entries: reply,
                    updated: result.updated.len(),
                })
            }
            other => Err(TransportError::Rejected {
                peer: shared.id.clone(),
                reason: format!("sync cannot handle {}", other.kind()),
            }),
        })
    }
}

/// `base` raised to cover every vector in `entries`
fn covering(base: VersionVector, entries: &BTreeMap<String, StateVersion>) -> VersionVector {
    entries
        .values()
        .fold(base, |acc, version| acc.merged(&version.vector))
}
