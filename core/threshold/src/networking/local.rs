use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    Mutex,
};

use super::Networking;
use crate::error::TransportError;
use crate::execution::runtime::party::NodeId;

/// Simulated state of a node's link to the rest of the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Sends to and from the node fail with a transient error.
    Disconnected,
    /// The node looks reachable, but everything to and from it is dropped.
    Muted,
}

type Inbox = (
    UnboundedSender<(NodeId, Vec<u8>)>,
    Arc<Mutex<UnboundedReceiver<(NodeId, Vec<u8>)>>>,
);

/// A simple implementation of networking for local execution.
///
/// This implementation is intended for local development/testing purposes
/// only. Every node gets an in-memory inbox, and links can be broken to simulate failures.
#[derive(Clone, Default)]
pub struct LocalNetworkingProducer {
    inboxes: Arc<DashMap<NodeId, Inbox>>,
    links: Arc<DashMap<NodeId, LinkState>>,
}

impl LocalNetworkingProducer {
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a NodeId>) -> Self {
        let producer = LocalNetworkingProducer::default();
        for node in nodes {
            let (tx, rx) = unbounded_channel();
            producer
                .inboxes
                .insert(node.clone(), (tx, Arc::new(Mutex::new(rx))));
            producer.links.insert(node.clone(), LinkState::Connected);
        }
        producer
    }

    pub fn user_net(&self, owner: NodeId) -> LocalNetworking {
        LocalNetworking {
            owner,
            inboxes: Arc::clone(&self.inboxes),
            links: Arc::clone(&self.links),
        }
    }

    pub fn disconnect(&self, node: &NodeId) {
        self.set_link(node, LinkState::Disconnected);
    }

    pub fn reconnect(&self, node: &NodeId) {
        self.set_link(node, LinkState::Connected);
    }

    pub fn mute(&self, node: &NodeId) {
        self.set_link(node, LinkState::Muted);
    }

    fn set_link(&self, node: &NodeId, state: LinkState) {
        tracing::info!("Link of {node} is now {state:?}");
        self.links.insert(node.clone(), state);
    }
}

pub struct LocalNetworking {
    owner: NodeId,
    inboxes: Arc<DashMap<NodeId, Inbox>>,
    links: Arc<DashMap<NodeId, LinkState>>,
}

impl LocalNetworking {
    fn link(&self, node: &NodeId) -> LinkState {
        self.links
            .get(node)
            .map(|state| *state)
            .unwrap_or(LinkState::Disconnected)
    }
}

#[async_trait]
impl Networking for LocalNetworking {
    fn owner(&self) -> &NodeId {
        &self.owner
    }

    async fn send(&self, value: Vec<u8>, receiver: &NodeId) -> Result<(), TransportError> {
        let links = (self.link(&self.owner), self.link(receiver));
        if links.0 == LinkState::Disconnected || links.1 == LinkState::Disconnected {
            return Err(TransportError::Transient(format!(
                "link between {} and {receiver} is down",
                self.owner
            )));
        }
        if links.0 == LinkState::Muted || links.1 == LinkState::Muted {
            tracing::debug!("Dropping message from {} to {receiver}", self.owner);
            return Ok(());
        }
        let sender = self
            .inboxes
            .get(receiver)
            .map(|inbox| inbox.0.clone())
            .ok_or_else(|| TransportError::Unreachable {
                node: receiver.clone(),
                reason: "unknown node".to_string(),
            })?;
        sender
            .send((self.owner.clone(), value))
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<(NodeId, Vec<u8>), TransportError> {
        let receiver = self
            .inboxes
            .get(&self.owner)
            .map(|inbox| Arc::clone(&inbox.1))
            .ok_or(TransportError::Closed)?;
        let mut receiver = receiver.lock().await;
        receiver.recv().await.ok_or(TransportError::Closed)
    }

    fn is_reachable(&self, node: &NodeId) -> bool {
        self.link(&self.owner) != LinkState::Disconnected
            && self.link(node) != LinkState::Disconnected
    }
}
