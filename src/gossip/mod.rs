//! Epidemic dissemination of replica state
//!
//! Every round each agent exchanges its state with `fanout` randomly chosen
//! peers. An exchange is push-pull: the initiator sends its digest and
//! entries, the receiver merges and answers with its own entries unless the
//! digests already matched. Rounds have no global barrier; an unreachable
//! peer only costs the exchange it was picked for.

use crate::config::GossipConfig;
use crate::error::{ConsensusError, Result, TransportError, ValidationError};
use crate::network::{Message, NetworkHandler, Transport};
use crate::state::{ConflictResolver, MergeReport, Payload, ReplicaState, StateVersion};
use crate::types::AgentId;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One agent's replica plus the means to gossip it
pub struct GossipNode {
    id: AgentId,
    state: Arc<RwLock<ReplicaState>>,
    resolver: ConflictResolver,
    transport: Arc<dyn Transport>,
}

impl GossipNode {
    pub fn new(transport: Arc<dyn Transport>, resolver: ConflictResolver) -> Self {
        let id = transport.local_id().clone();
        Self {
            state: Arc::new(RwLock::new(ReplicaState::new(id.clone()))),
            id,
            resolver,
            transport,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Local write, picked up by the next exchange
    pub fn put(&self, key: impl Into<String>, payload: Payload) -> StateVersion {
        self.state.write().put(key, payload).clone()
    }

    pub fn get(&self, key: &str) -> Option<StateVersion> {
        self.state.read().get(key).cloned()
    }

    pub fn digest(&self) -> String {
        self.state.read().digest()
    }

    pub fn snapshot(&self) -> ReplicaState {
        self.state.read().clone()
    }

    /// Handler answering gossip digests sent by peers
    pub fn handler(&self) -> NetworkHandler {
        let state = Arc::clone(&self.state);
        let resolver = self.resolver;
        let id = self.id.clone();
        NetworkHandler::new(move |from, message| match message {
            Message::GossipDigest { digest, entries } => {
                let mut replica = state.write();
                if replica.digest() == digest {
                    return Ok(Message::GossipReply {
                        digest,
                        entries: BTreeMap::new(),
                    });
                }
                let report = replica.merge_entries(&entries, &resolver);
                if !report.conflicts.is_empty() {
                    debug!(agent = %id, peer = %from, conflicts = report.conflicts.len(), "Gossip: unresolved keys kept");
                }
                Ok(Message::GossipReply {
                    digest: replica.digest(),
                    entries: replica.entries().clone(),
                })
            }
            other => Err(TransportError::Rejected {
                peer: id.clone(),
                reason: format!("gossip cannot handle {}", other.kind()),
            }),
        })
    }

    /// Push-pull exchange with one peer
    pub async fn exchange(&self, peer: &AgentId, timeout: Duration) -> Result<MergeReport> {
        let request = {
            let replica = self.state.read();
            Message::GossipDigest {
                digest: replica.digest(),
                entries: replica.entries().clone(),
            }
        };
        let reply = match tokio::time::timeout(timeout, self.transport.send(peer, request)).await {
            Ok(reply) => reply?,
            Err(_) => return Err(ConsensusError::PeerUnreachable(peer.clone())),
        };
        match reply {
            Message::GossipReply { entries, .. } if entries.is_empty() => Ok(MergeReport::default()),
            Message::GossipReply { entries, .. } => {
                Ok(self.state.write().merge_entries(&entries, &self.resolver))
            }
            other => Err(TransportError::Rejected {
                peer: peer.clone(),
                reason: format!("unexpected {} during gossip", other.kind()),
            }
            .into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipOutcome {
    Converged,
    ConvergenceTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GossipReport {
    pub rounds: usize,
    pub ratio: f64,
    pub outcome: GossipOutcome,
}

impl GossipReport {
    pub fn converged(&self) -> bool {
        self.outcome == GossipOutcome::Converged
    }

    /// Turn a run that stopped short of the target into `ConvergenceTimeout`
    pub fn into_result(self) -> Result<GossipReport> {
        match self.outcome {
            GossipOutcome::Converged => Ok(self),
            GossipOutcome::ConvergenceTimeout => Err(ConsensusError::ConvergenceTimeout {
                ratio: self.ratio,
                rounds: self.rounds,
            }),
        }
    }
}

/// Drives gossip rounds over a fixed set of nodes
pub struct GossipProtocol {
    nodes: Vec<Arc<GossipNode>>,
    config: GossipConfig,
    rng: Mutex<StdRng>,
    rounds: AtomicUsize,
}

impl GossipProtocol {
    pub fn new(nodes: Vec<Arc<GossipNode>>, config: GossipConfig) -> Result<Self> {
        config.validate()?;
        let mut seen = HashSet::new();
        if nodes.is_empty() || !nodes.iter().all(|node| seen.insert(node.id().clone())) {
            return Err(ValidationError::InvalidParticipants.into());
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            nodes,
            config,
            rng: Mutex::new(rng),
            rounds: AtomicUsize::new(0),
        })
    }

    pub fn nodes(&self) -> &[Arc<GossipNode>] {
        &self.nodes
    }

    /// Rounds run so far
    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Up to `fanout` distinct peers, never the node itself
    fn select_peers(&self, node: &AgentId) -> Vec<AgentId> {
        let candidates: Vec<&AgentId> = self
            .nodes
            .iter()
            .map(|n| n.id())
            .filter(|id| *id != node)
            .collect();
        let mut rng = self.rng.lock();
        candidates
            .choose_multiple(&mut *rng, self.config.fanout)
            .map(|id| (*id).clone())
            .collect()
    }

    /// Run one round and return the convergence ratio afterwards
    pub async fn run_round(&self) -> f64 {
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = self.config.exchange_timeout;
        let mut exchanges = JoinSet::new();
        for node in &self.nodes {
            for peer in self.select_peers(node.id()) {
                let node = Arc::clone(node);
                exchanges.spawn(async move {
                    let result = node.exchange(&peer, timeout).await;
                    (node.id().clone(), peer, result)
                });
            }
        }

        let mut updated = 0;
        let mut skipped = 0;
        while let Some(joined) = exchanges.join_next().await {
            match joined {
                Ok((_, _, Ok(report))) => updated += report.updated.len(),
                Ok((node, peer, Err(e))) => {
                    skipped += 1;
                    debug!(node = %node, peer = %peer, error = %e, "Gossip: exchange skipped");
                }
                Err(e) => warn!(error = %e, "Gossip: exchange task failed"),
            }
        }

        let ratio = self.convergence_ratio();
        debug!(round, ratio, updated, skipped, "Gossip: round complete");
        ratio
    }

    /// Fraction of nodes sharing the most common digest
    pub fn convergence_ratio(&self) -> f64 {
        let mut groups: HashMap<String, usize> = HashMap::new();
        for node in &self.nodes {
            *groups.entry(node.digest()).or_insert(0) += 1;
        }
        let largest = groups.values().copied().max().unwrap_or(0);
        largest as f64 / self.nodes.len() as f64
    }

    /// Gossip until the configured ratio is reached, `max_rounds` run out or
    /// `deadline` passes. A round cut off by the deadline is abandoned.
    pub async fn run(&self, deadline: Instant) -> GossipReport {
        let target = self.config.convergence_ratio;
        let mut ratio = self.convergence_ratio();
        let mut rounds = 0;
        while ratio < target && rounds < self.config.max_rounds {
            match tokio::time::timeout_at(deadline, self.run_round()).await {
                Ok(r) => {
                    ratio = r;
                    rounds += 1;
                }
                Err(_) => {
                    ratio = self.convergence_ratio();
                    break;
                }
            }
        }

        let outcome = if ratio >= target {
            GossipOutcome::Converged
        } else {
            GossipOutcome::ConvergenceTimeout
        };
        info!(rounds, ratio, ?outcome, "Gossip: run finished");
        GossipReport {
            rounds,
            ratio,
            outcome,
        }
    }
}
