//! Raft leader election and log replication
//!
//! ## Structure
//! - `log.rs` - Replicated log
//! - `rpc.rs` - RequestVote / AppendEntries messages
//! - `node.rs` - Synchronous per-node state machine
//! - `tests.rs` - Cluster scenarios over the simulated network
//!
//! [`RaftConsensus`] wraps a [`RaftNode`] with a transport. State mutation
//! happens under the node's mutex and never across an await point; peer
//! calls run concurrently with the lock released.

mod log;
mod node;
mod rpc;

pub use log::{LogEntry, LogIndex, RaftLog, Term};
pub use node::{RaftNode, RaftStatus, Role};
pub use rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

use crate::config::RaftConfig;
use crate::consensus::{
    ConsensusAlgorithm, ConsensusRequest, ConsensusRequirements, Decision, VoteTally,
};
use crate::error::{ConsensusError, Result, TransportError, ValidationError};
use crate::network::{broadcast, Message, NetworkHandler, Transport};
use crate::storage::Storage;
use crate::types::{deadline_after, AgentId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Callback receiving each committed entry exactly once, in index order
pub type ApplyHook = Arc<dyn Fn(&LogEntry) + Send + Sync>;

pub struct RaftConsensus {
    id: AgentId,
    node: Arc<Mutex<RaftNode>>,
    transport: Arc<dyn Transport>,
    peers: Vec<AgentId>,
    config: RaftConfig,
    on_apply: Arc<RwLock<Option<ApplyHook>>>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Hand newly committed entries to the apply hook
fn apply_committed(node: &Mutex<RaftNode>, hook: &RwLock<Option<ApplyHook>>) {
    let entries = node.lock().take_committed();
    if entries.is_empty() {
        return;
    }
    let hook = hook.read().clone();
    if let Some(hook) = hook {
        for entry in &entries {
            hook(entry);
        }
    }
}

impl RaftConsensus {
    /// Create a node for `id` in a cluster of `id` plus `peers`.
    ///
    /// Term, vote and log are reloaded from `storage` before the node starts.
    pub fn new(
        id: impl Into<AgentId>,
        peers: Vec<AgentId>,
        transport: Arc<dyn Transport>,
        config: RaftConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let id = id.into();
        let node = RaftNode::restore(id.clone(), peers, config.clone(), storage)?;
        let peers = node.peers().to_vec();
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            id,
            node: Arc::new(Mutex::new(node)),
            transport,
            peers,
            config,
            on_apply: Arc::new(RwLock::new(None)),
            shutdown,
            driver: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn on_apply<F>(&self, hook: F)
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        *self.on_apply.write() = Some(Arc::new(hook));
    }

    pub fn status(&self) -> RaftStatus {
        self.node.lock().status()
    }

    pub fn role(&self) -> Role {
        self.node.lock().role()
    }

    pub fn term(&self) -> Term {
        self.node.lock().term()
    }

    pub fn leader(&self) -> Option<AgentId> {
        self.node.lock().leader().cloned()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.node.lock().commit_index()
    }

    pub fn log_entry(&self, index: LogIndex) -> Option<LogEntry> {
        self.node.lock().log().get(index).cloned()
    }

    /// Handler answering RequestVote and AppendEntries for this node
    pub fn handler(&self) -> NetworkHandler {
        let node = Arc::clone(&self.node);
        let hook = Arc::clone(&self.on_apply);
        let id = self.id.clone();
        NetworkHandler::new(move |_from, message| {
            let reply = match message {
                Message::RequestVote(args) => node
                    .lock()
                    .handle_request_vote(&args)
                    .map(Message::RequestVoteReply),
                Message::AppendEntries(args) => {
                    let reply = node.lock().handle_append_entries(&args);
                    if reply.is_ok() {
                        apply_committed(&node, &hook);
                    }
                    reply.map(Message::AppendEntriesReply)
                }
                other => {
                    return Err(TransportError::Rejected {
                        peer: id.clone(),
                        reason: format!("raft cannot handle {}", other.kind()),
                    })
                }
            };
            reply.map_err(|e| TransportError::Rejected {
                peer: id.clone(),
                reason: e.to_string(),
            })
        })
    }

    /// Run one election round; returns whether this node won
    pub async fn campaign(&self) -> Result<bool> {
        let args = self.node.lock().start_election()?;
        let won = self.role() == Role::Leader;
        if !won {
            let replies = broadcast(
                &self.transport,
                &self.peers,
                Message::RequestVote(args),
                self.config.rpc_timeout,
            )
            .await;
            for (peer, reply) in replies {
                match reply {
                    Ok(Message::RequestVoteReply(reply)) => {
                        self.node.lock().handle_vote_reply(&peer, &reply)?;
                    }
                    Ok(other) => debug!(peer = %peer, kind = other.kind(), "Raft: unexpected vote reply"),
                    Err(e) => debug!(peer = %peer, error = %e, "Raft: vote request failed"),
                }
            }
        }

        let leader = self.role() == Role::Leader;
        if leader {
            // Announce leadership before followers time out
            self.heartbeat().await?;
        }
        Ok(leader)
    }

    /// Send AppendEntries (with any pending entries) to every peer once
    pub async fn heartbeat(&self) -> Result<()> {
        let requests: Vec<(AgentId, AppendEntriesArgs)> = {
            let node = self.node.lock();
            node.check_halted()?;
            self.peers
                .iter()
                .filter_map(|peer| node.append_entries_for(peer).map(|args| (peer.clone(), args)))
                .collect()
        };
        if requests.is_empty() {
            apply_committed(&self.node, &self.on_apply);
            return Ok(());
        }

        let mut calls = JoinSet::new();
        for (peer, args) in requests {
            let transport = Arc::clone(&self.transport);
            let timeout = self.config.rpc_timeout;
            calls.spawn(async move {
                let reply =
                    tokio::time::timeout(timeout, transport.send(&peer, Message::AppendEntries(args)))
                        .await;
                (peer, reply)
            });
        }

        while let Some(joined) = calls.join_next().await {
            let (peer, reply) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(node = %self.id, error = %e, "Raft: append task failed");
                    continue;
                }
            };
            match reply {
                Ok(Ok(Message::AppendEntriesReply(reply))) => {
                    self.node.lock().handle_append_reply(&peer, &reply)?;
                }
                Ok(Ok(other)) => debug!(peer = %peer, kind = other.kind(), "Raft: unexpected append reply"),
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "Raft: append failed"),
                Err(_) => debug!(peer = %peer, "Raft: append timed out"),
            }
        }
        apply_committed(&self.node, &self.on_apply);
        Ok(())
    }

    /// One driver step: heartbeat as leader, campaign when the election timer expired
    pub async fn tick(&self) -> Result<()> {
        let (role, due) = {
            let node = self.node.lock();
            (node.role(), node.election_due(Instant::now()))
        };
        if role == Role::Leader {
            self.heartbeat().await
        } else if due {
            self.campaign().await.map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Propose `command` and wait until it is committed by a majority.
    ///
    /// Fails with `NotLeader` on followers and `Timeout` if the entry is not
    /// committed before `timeout` (e.g. the leader sits in a minority partition).
    pub async fn propose(&self, command: serde_json::Value, timeout: Duration) -> Result<LogEntry> {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let entry = self.node.lock().propose(command)?;
        debug!(node = %self.id, index = entry.index, term = entry.term, "Raft: entry proposed");

        loop {
            let (committed, still_ours, role, leader) = {
                let node = self.node.lock();
                (
                    node.commit_index() >= entry.index,
                    node.log().term_at(entry.index) == Some(entry.term),
                    node.role(),
                    node.leader().cloned(),
                )
            };
            if committed && still_ours {
                apply_committed(&self.node, &self.on_apply);
                return Ok(entry);
            }
            if !still_ours || role != Role::Leader {
                return Err(ConsensusError::NotLeader { leader });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConsensusError::Timeout {
                    elapsed: now - started,
                });
            }

            if tokio::time::timeout_at(deadline, self.heartbeat()).await.is_ok()
                && self.commit_index() < entry.index
            {
                let pause = self
                    .config
                    .heartbeat_interval
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(pause).await;
            }
        }
    }

    /// Start the background driver; a second call is a no-op
    pub fn spawn(self: &Arc<Self>) {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return;
        }
        let raft = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.heartbeat_interval;
        *driver = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = raft.tick().await {
                            if e.is_fatal() {
                                error!(node = %raft.id, error = %e, "Raft: driver stopped");
                                break;
                            }
                            debug!(node = %raft.id, error = %e, "Raft: tick failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            if let Err(e) = handle.await {
                warn!(node = %self.id, error = %e, "Raft: driver task failed");
            }
        }
    }
}

#[async_trait]
impl ConsensusAlgorithm for RaftConsensus {
    /// Replicates the first candidate through the log; the decision is that value
    async fn decide(&self, request: &ConsensusRequest) -> Result<Decision> {
        let value = request.proposal.candidates.first().cloned().ok_or_else(|| {
            ValidationError::InvalidProposal("raft needs a candidate value".to_string())
        })?;
        let command = json!({
            "request_id": request.id,
            "subject": request.proposal.subject,
            "value": value,
        });
        let entry = self.propose(command, request.remaining()).await?;

        let replicated = self.node.lock().replication_count(entry.index);
        let mut tally = VoteTally {
            denominator: (self.peers.len() + 1) as f64,
            ..VoteTally::default()
        };
        tally.counts.insert(value.clone(), replicated as f64);
        Ok(Decision { value, tally })
    }

    fn name(&self) -> &str {
        "Raft"
    }

    fn requirements(&self) -> ConsensusRequirements {
        ConsensusRequirements {
            requires_majority: true,
            min_nodes: Some((self.peers.len() + 1) / 2 + 1),
            description: format!(
                "Raft: leader commits once {} of {} nodes store the entry",
                (self.peers.len() + 1) / 2 + 1,
                self.peers.len() + 1
            ),
        }
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
