//! Messages exchanged between agents
//!
//! Only semantics live here; encoding is the transport's concern.

use crate::consensus::algorithms::raft::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply,
};
use crate::consensus::{Proposal, Vote};
use crate::state::{StateVersion, VersionVector};
use crate::synchronizer::SyncMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message family, used to route to the handler registered for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Vote,
    Raft,
    Gossip,
    Sync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    VoteRequest {
        request_id: u64,
        proposal: Proposal,
    },
    VoteReply(Vote),
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
    GossipDigest {
        digest: String,
        entries: BTreeMap<String, StateVersion>,
    },
    /// Receiver's post-merge state; `entries` is empty when digests already match
    GossipReply {
        digest: String,
        entries: BTreeMap<String, StateVersion>,
    },
    SyncPush {
        mode: SyncMode,
        round: u64,
        /// Sender's checkpoint with the receiver; a delta reply skips what it covers
        known: VersionVector,
        entries: BTreeMap<String, StateVersion>,
    },
    SyncReply {
        entries: BTreeMap<String, StateVersion>,
        updated: usize,
    },
}

impl Message {
    pub fn channel(&self) -> Channel {
        match self {
            Message::VoteRequest { .. } | Message::VoteReply(_) => Channel::Vote,
            Message::RequestVote(_)
            | Message::RequestVoteReply(_)
            | Message::AppendEntries(_)
            | Message::AppendEntriesReply(_) => Channel::Raft,
            Message::GossipDigest { .. } | Message::GossipReply { .. } => Channel::Gossip,
            Message::SyncPush { .. } | Message::SyncReply { .. } => Channel::Sync,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::VoteRequest { .. } => "vote_request",
            Message::VoteReply(_) => "vote_reply",
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteReply(_) => "request_vote_reply",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesReply(_) => "append_entries_reply",
            Message::GossipDigest { .. } => "gossip_digest",
            Message::GossipReply { .. } => "gossip_reply",
            Message::SyncPush { .. } => "sync_push",
            Message::SyncReply { .. } => "sync_reply",
        }
    }
}
