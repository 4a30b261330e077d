//! Networking traits and implementations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::execution::runtime::party::NodeId;

pub mod local;
pub mod sending;
pub mod value;

pub type NetworkingImpl = Arc<dyn Networking>;

/// Requirements for networking interface.
///
/// Messages between a given pair of nodes are delivered in order, but no order is
/// guaranteed across senders.
#[async_trait]
pub trait Networking: Send + Sync {
    fn owner(&self) -> &NodeId;

    /// A [TransportError::Transient] error means the message may be retried.
    async fn send(&self, value: Vec<u8>, receiver: &NodeId) -> Result<(), TransportError>;

    /// Next message addressed to the owner, from any sender.
    async fn receive(&self) -> Result<(NodeId, Vec<u8>), TransportError>;

    /// Whether `node` is currently believed to be reachable.
    fn is_reachable(&self, node: &NodeId) -> bool;
}
