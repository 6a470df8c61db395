//! In-process network for exercising the protocols without sockets
//!
//! Supports partitions, agents going down and uniform latency. A call that
//! is dropped before its latency elapses never reaches the receiving
//! handler, so abandoned calls leave no trace on the remote side.

use super::{Channel, Message, NetworkHandler, Transport};
use crate::error::TransportError;
use crate::types::AgentId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct NetState {
    handlers: HashMap<(AgentId, Channel), Arc<NetworkHandler>>,
    /// Partition group per agent; agents not listed share group 0
    groups: HashMap<AgentId, usize>,
    down: HashSet<AgentId>,
    latency: Duration,
}

impl NetState {
    fn reachable(&self, from: &AgentId, to: &AgentId) -> bool {
        if self.down.contains(from) || self.down.contains(to) {
            return false;
        }
        let group_of = |id: &AgentId| self.groups.get(id).copied().unwrap_or(0);
        group_of(from) == group_of(to)
    }
}

#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    state: Arc<RwLock<NetState>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport endpoint sending on behalf of `id`
    pub fn endpoint(&self, id: impl Into<AgentId>) -> Arc<dyn Transport> {
        Arc::new(SimulatedTransport {
            id: id.into(),
            state: Arc::clone(&self.state),
        })
    }

    pub fn register(&self, id: impl Into<AgentId>, channel: Channel, handler: NetworkHandler) {
        self.state
            .write()
            .handlers
            .insert((id.into(), channel), Arc::new(handler));
    }

    /// Split agents into isolated groups; unlisted agents join the first group
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut state = self.state.write();
        state.groups.clear();
        for (group, members) in groups.iter().enumerate() {
            for member in members.iter() {
                state.groups.insert(member.to_string(), group);
            }
        }
        tracing::debug!(groups = groups.len(), "SimulatedNetwork: partitioned");
    }

    pub fn heal(&self) {
        self.state.write().groups.clear();
        tracing::debug!("SimulatedNetwork: partitions healed");
    }

    pub fn set_down(&self, id: &str, down: bool) {
        let mut state = self.state.write();
        if down {
            state.down.insert(id.to_string());
        } else {
            state.down.remove(id);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.write().latency = latency;
    }
}

struct SimulatedTransport {
    id: AgentId,
    state: Arc<RwLock<NetState>>,
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn local_id(&self) -> &AgentId {
        &self.id
    }

    async fn send(&self, peer: &AgentId, message: Message) -> Result<Message, TransportError> {
        let latency = self.state.read().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let handler = {
            let state = self.state.read();
            if !state.reachable(&self.id, peer) {
                return Err(TransportError::Unreachable(peer.clone()));
            }
            state.handlers.get(&(peer.clone(), message.channel())).cloned()
        };

        match handler {
            Some(handler) => handler.handle(&self.id, message),
            None => Err(TransportError::Unreachable(peer.clone())),
        }
    }
}
