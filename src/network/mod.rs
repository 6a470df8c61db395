//! Transport abstraction between agents
//!
//! Raft, gossip, vote collection and sync only ever talk to a [`Transport`],
//! so the same logic runs over [`sim::SimulatedNetwork`] in tests and over a
//! real network transport in deployment.

pub mod message;
pub mod sim;

pub use message::{Channel, Message};

use crate::error::TransportError;
use crate::types::AgentId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the agent this endpoint sends on behalf of
    fn local_id(&self) -> &AgentId;

    /// Deliver `message` to `peer` and wait for its reply
    async fn send(&self, peer: &AgentId, message: Message) -> Result<Message, TransportError>;
}

type HandlerFn = dyn Fn(&AgentId, Message) -> Result<Message, TransportError> + Send + Sync;

/// Answers incoming messages on behalf of one agent
pub struct NetworkHandler {
    pub on_message: Arc<HandlerFn>,
}

impl NetworkHandler {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&AgentId, Message) -> Result<Message, TransportError> + Send + Sync + 'static,
    {
        NetworkHandler {
            on_message: Arc::new(handler),
        }
    }

    pub fn handle(&self, from: &AgentId, message: Message) -> Result<Message, TransportError> {
        (self.on_message)(from, message)
    }
}

/// Send `message` to every peer concurrently, each bounded by `timeout`.
///
/// Replies are yielded as they complete. A peer that misses the timeout is
/// reported unreachable; its in-flight call is dropped. Callers leave the
/// local agent out of `peers` unless it answers through its own handler.
pub fn fan_out(
    transport: &Arc<dyn Transport>,
    peers: &[AgentId],
    message: Message,
    timeout: Duration,
) -> JoinSet<(AgentId, Result<Message, TransportError>)> {
    let mut calls = JoinSet::new();
    for peer in peers {
        let transport = Arc::clone(transport);
        let peer = peer.clone();
        let message = message.clone();
        calls.spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.send(&peer, message)).await
            {
                Ok(reply) => reply,
                Err(_) => Err(TransportError::Unreachable(peer.clone())),
            };
            (peer, result)
        });
    }
    calls
}

/// Broadcast to all peers and collect every reply
pub async fn broadcast(
    transport: &Arc<dyn Transport>,
    peers: &[AgentId],
    message: Message,
    timeout: Duration,
) -> Vec<(AgentId, Result<Message, TransportError>)> {
    let mut calls = fan_out(transport, peers, message, timeout);
    let mut replies = Vec::with_capacity(peers.len());
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok(reply) => replies.push(reply),
            Err(e) => tracing::warn!(error = %e, "Network: broadcast task failed"),
        }
    }
    replies
}
