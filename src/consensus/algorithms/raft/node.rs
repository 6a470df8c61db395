//! Single-node Raft state machine
//!
//! Pure state transitions driven by RPCs and timer checks. Nothing here
//! touches the network; [`super::RaftConsensus`] owns the I/O and serializes
//! access to a node behind a mutex.

use super::log::{LogEntry, LogIndex, RaftLog, Term};
use super::rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::config::RaftConfig;
use crate::error::{ConsensusError, Result};
use crate::storage::{HardState, Storage};
use crate::types::AgentId;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaftStatus {
    pub id: AgentId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<AgentId>,
    pub commit_index: LogIndex,
    pub last_log_index: LogIndex,
    pub halted: bool,
}

pub struct RaftNode {
    id: AgentId,
    peers: Vec<AgentId>,
    role: Role,
    current_term: Term,
    voted_for: Option<AgentId>,
    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader: Option<AgentId>,
    votes: HashSet<AgentId>,
    next_index: HashMap<AgentId, LogIndex>,
    match_index: HashMap<AgentId, LogIndex>,
    election_deadline: Instant,
    halted: Option<String>,
    config: RaftConfig,
    storage: Arc<dyn Storage>,
}

impl RaftNode {
    /// Build a node, reloading term, vote and log from `storage`
    pub fn restore(
        id: AgentId,
        peers: Vec<AgentId>,
        config: RaftConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let hard = storage.load_hard_state(&id)?.unwrap_or_default();
        let entries = storage.load_log(&id)?;
        if !entries.is_empty() {
            info!(
                node = %id,
                term = hard.current_term,
                entries = entries.len(),
                "Raft: restored persisted state"
            );
        }
        let peers = peers.into_iter().filter(|p| *p != id).collect();

        let mut node = Self {
            id,
            peers,
            role: Role::Follower,
            current_term: hard.current_term,
            voted_for: hard.voted_for,
            log: RaftLog::from_entries(entries),
            commit_index: 0,
            last_applied: 0,
            leader: None,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now(),
            halted: None,
            config,
            storage,
        };
        node.reset_election_timer();
        Ok(node)
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn peers(&self) -> &[AgentId] {
        &self.peers
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.current_term
    }

    pub fn leader(&self) -> Option<&AgentId> {
        self.leader.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id.clone(),
            role: self.role,
            term: self.current_term,
            leader: self.leader.clone(),
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
            halted: self.halted.is_some(),
        }
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn check_halted(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(ConsensusError::InvariantViolation(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&mut self, reason: String) -> ConsensusError {
        error!(node = %self.id, term = self.current_term, reason = %reason, "Raft: halting node");
        self.halted = Some(reason.clone());
        self.role = Role::Follower;
        ConsensusError::InvariantViolation(reason)
    }

    fn persist_hard_state(&self) -> Result<()> {
        self.storage.save_hard_state(
            &self.id,
            &HardState {
                current_term: self.current_term,
                voted_for: self.voted_for.clone(),
            },
        )?;
        Ok(())
    }

    pub fn reset_election_timer(&mut self) {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = (self.config.election_timeout_max.as_millis() as u64).max(min);
        let timeout = rand::thread_rng().gen_range(min..=max);
        self.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    pub fn election_due(&self, now: Instant) -> bool {
        self.halted.is_none() && self.role != Role::Leader && now >= self.election_deadline
    }

    /// Adopt `term` as follower; clears the vote only when the term advances
    fn become_follower(&mut self, term: Term, leader: Option<AgentId>) -> Result<()> {
        if term > self.current_term {
            info!(node = %self.id, from = self.current_term, to = term, "Raft: term advanced");
            self.current_term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        if self.role != Role::Follower {
            info!(node = %self.id, term = self.current_term, role = ?self.role, "Raft: stepping down to follower");
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.reset_election_timer();
        Ok(())
    }

    fn become_leader(&mut self) {
        info!(node = %self.id, term = self.current_term, "Raft: became leader");
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        let next = self.log.last_index() + 1;
        self.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();
    }

    /// Start an election for the next term, voting for ourselves
    pub fn start_election(&mut self) -> Result<RequestVoteArgs> {
        self.check_halted()?;
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.persist_hard_state()?;
        self.reset_election_timer();
        info!(node = %self.id, term = self.current_term, "Raft: starting election");

        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
        Ok(RequestVoteArgs {
            term: self.current_term,
            candidate: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> Result<RequestVoteReply> {
        self.check_halted()?;
        if args.term < self.current_term {
            debug!(node = %self.id, candidate = %args.candidate, term = args.term, "Raft: rejecting stale vote request");
            return Ok(RequestVoteReply {
                term: self.current_term,
                granted: false,
            });
        }
        if args.term > self.current_term {
            self.become_follower(args.term, None)?;
        }

        let free = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == args.candidate,
        };
        let granted = free && self.log.is_up_to_date(args.last_log_index, args.last_log_term);
        if granted {
            self.voted_for = Some(args.candidate.clone());
            self.persist_hard_state()?;
            self.reset_election_timer();
        }
        debug!(node = %self.id, candidate = %args.candidate, term = args.term, granted, "Raft: vote request handled");
        Ok(RequestVoteReply {
            term: self.current_term,
            granted,
        })
    }

    /// Returns true when this reply completed a majority
    pub fn handle_vote_reply(&mut self, from: &AgentId, reply: &RequestVoteReply) -> Result<bool> {
        if reply.term > self.current_term {
            self.become_follower(reply.term, None)?;
            return Ok(false);
        }
        if self.role != Role::Candidate || reply.term != self.current_term || !reply.granted {
            return Ok(false);
        }
        self.votes.insert(from.clone());
        if self.votes.len() >= self.majority() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    /// AppendEntries for `peer` from its next index; `None` unless leader
    pub fn append_entries_for(&self, peer: &AgentId) -> Option<AppendEntriesArgs> {
        if self.role != Role::Leader {
            return None;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_log_index = next - 1;
        Some(AppendEntriesArgs {
            term: self.current_term,
            leader: self.id.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> Result<AppendEntriesReply> {
        self.check_halted()?;
        let reject = |node: &Self| AppendEntriesReply {
            term: node.current_term,
            success: false,
            match_index: 0,
            last_log_index: node.log.last_index(),
        };

        if args.term < self.current_term {
            debug!(node = %self.id, leader = %args.leader, term = args.term, "Raft: rejecting stale append");
            return Ok(reject(self));
        }
        if args.term == self.current_term && args.leader != self.id {
            let conflicting = match (&self.role, &self.leader) {
                (Role::Leader, _) => Some(self.id.clone()),
                (_, Some(known)) if *known != args.leader => Some(known.clone()),
                _ => None,
            };
            if let Some(other) = conflicting {
                return Err(self.halt(format!(
                    "two leaders in term {}: {} and {}",
                    self.current_term, other, args.leader
                )));
            }
        }
        self.become_follower(args.term, Some(args.leader.clone()))?;

        if self.log.term_at(args.prev_log_index) != Some(args.prev_log_term) {
            debug!(node = %self.id, prev_index = args.prev_log_index, "Raft: log consistency check failed");
            return Ok(reject(self));
        }

        let mut appended = Vec::new();
        for entry in &args.entries {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(self.halt(format!(
                            "leader {} overwrites committed index {}",
                            args.leader, entry.index
                        )));
                    }
                    self.log.truncate_from(entry.index);
                    self.storage.truncate_log(&self.id, entry.index)?;
                }
                None => {}
            }
            appended.push(self.log.append(entry.term, entry.command.clone()));
        }
        if !appended.is_empty() {
            self.storage.append_entries(&self.id, &appended)?;
        }

        let match_index = args.prev_log_index + args.entries.len() as LogIndex;
        if args.leader_commit > self.commit_index {
            self.commit_index = args.leader_commit.min(match_index);
        }
        Ok(AppendEntriesReply {
            term: self.current_term,
            success: true,
            match_index,
            last_log_index: self.log.last_index(),
        })
    }

    pub fn handle_append_reply(&mut self, peer: &AgentId, reply: &AppendEntriesReply) -> Result<()> {
        if reply.term > self.current_term {
            info!(node = %self.id, peer = %peer, term = reply.term, "Raft: observed higher term");
            return self.become_follower(reply.term, None);
        }
        if self.role != Role::Leader || reply.term != self.current_term {
            return Ok(());
        }

        if reply.success {
            let matched = self.match_index.entry(peer.clone()).or_insert(0);
            *matched = (*matched).max(reply.match_index);
            let next = *matched + 1;
            self.next_index.insert(peer.clone(), next);
            self.advance_commit();
        } else {
            let current = self
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(self.log.last_index() + 1);
            let rewound = current.saturating_sub(1).min(reply.last_log_index + 1).max(1);
            self.next_index.insert(peer.clone(), rewound);
        }
        Ok(())
    }

    /// Commit the highest current-term index stored on a majority
    fn advance_commit(&mut self) {
        let majority = self.majority();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            if self.log.term_at(index) == Some(self.current_term)
                && self.replication_count(index) >= majority
            {
                debug!(node = %self.id, commit_index = index, "Raft: commit index advanced");
                self.commit_index = index;
                return;
            }
            index -= 1;
        }
    }

    /// Nodes, including the leader, known to store `index`
    pub fn replication_count(&self, index: LogIndex) -> usize {
        let own = usize::from(self.log.last_index() >= index);
        own + self.match_index.values().filter(|m| **m >= index).count()
    }

    /// Append a command as leader
    pub fn propose(&mut self, command: serde_json::Value) -> Result<LogEntry> {
        self.check_halted()?;
        if self.role != Role::Leader {
            return Err(ConsensusError::NotLeader {
                leader: self.leader.clone(),
            });
        }
        let entry = self.log.append(self.current_term, command);
        self.storage.append_entries(&self.id, std::slice::from_ref(&entry))?;
        self.advance_commit();
        Ok(entry)
    }

    /// Committed entries not yet handed to the state machine
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        if self.commit_index <= self.last_applied {
            return Vec::new();
        }
        let entries = self.log.slice(self.last_applied + 1, self.commit_index);
        self.last_applied = self.commit_index;
        entries
    }
}
