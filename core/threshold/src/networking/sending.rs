use std::time::Duration;

use backoff::{future::retry_notify, ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::{value::NetworkValue, NetworkingImpl};
use crate::error::TransportError;
use crate::execution::runtime::party::NodeId;
use crate::scheme::MheScheme;

/// Retry policy applied to every outgoing message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Once this much time has passed, the receiver is considered unreachable.
    pub max_elapsed_time: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Duration::from_secs(5),
            multiplier: 1.5,
        }
    }
}

impl RetryConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(Some(self.max_elapsed_time))
            .build()
    }
}

/// Sending side of a node: serializes values and retries transient failures.
#[derive(Clone)]
pub struct Outbox {
    net: NetworkingImpl,
    retry: RetryConfig,
}

impl Outbox {
    pub fn new(net: NetworkingImpl, retry: RetryConfig) -> Self {
        Outbox { net, retry }
    }

    pub fn owner(&self) -> &NodeId {
        self.net.owner()
    }

    pub fn is_reachable(&self, node: &NodeId) -> bool {
        node == self.owner() || self.net.is_reachable(node)
    }

    pub fn networking(&self) -> &NetworkingImpl {
        &self.net
    }

    pub async fn send<S: MheScheme>(
        &self,
        value: &NetworkValue<S>,
        receiver: &NodeId,
    ) -> Result<(), TransportError> {
        let bytes = value
            .to_network()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        tracing::trace!("Sending {} to {receiver}", value.type_name());
        self.send_bytes(bytes, receiver).await
    }

    /// Sends the same value to every receiver, serializing it once.
    ///
    /// Returns the receivers that could not be reached.
    pub async fn broadcast<'a, S: MheScheme>(
        &self,
        value: &NetworkValue<S>,
        receivers: impl IntoIterator<Item = &'a NodeId>,
    ) -> Vec<(NodeId, TransportError)> {
        let receivers: Vec<&NodeId> = receivers.into_iter().collect();
        let bytes = match value.to_network() {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = TransportError::Codec(e.to_string());
                return receivers
                    .into_iter()
                    .map(|node| (node.clone(), err.clone()))
                    .collect();
            }
        };
        let results = join_all(
            receivers
                .iter()
                .map(|receiver| self.send_bytes(bytes.clone(), receiver)),
        )
        .await;
        receivers
            .into_iter()
            .zip(results)
            .filter_map(|(node, res)| res.err().map(|e| (node.clone(), e)))
            .collect()
    }

    async fn send_bytes(&self, bytes: Vec<u8>, receiver: &NodeId) -> Result<(), TransportError> {
        let net = &self.net;
        let bytes = &bytes;
        let send_fn = || async move {
            net.send(bytes.clone(), receiver)
                .await
                .map_err(|e| match e {
                    TransportError::Transient(_) => backoff::Error::transient(e),
                    e => backoff::Error::permanent(e),
                })
        };
        let on_network_fail = |e: TransportError, duration: Duration| {
            tracing::debug!(
                "Network retry for message to {receiver}: {e} - Duration {:?}",
                duration
            );
        };
        retry_notify(self.retry.backoff(), send_fn, on_network_fail)
            .await
            .map_err(|e| {
                tracing::warn!("Failed to send message to {receiver} after retries: {e}");
                match e {
                    TransportError::Transient(reason) => TransportError::Unreachable {
                        node: receiver.clone(),
                        reason,
                    },
                    e => e,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::networking::local::LocalNetworkingProducer;
    use crate::networking::Networking;
    use crate::scheme::reference::ReferenceScheme;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            max_elapsed_time: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let alice = NodeId::from("alice");
        let bob = NodeId::from("bob");
        let producer = LocalNetworkingProducer::from_nodes([&alice, &bob]);
        let outbox = Outbox::new(Arc::new(producer.user_net(alice.clone())), fast_retry());
        let net_bob = producer.user_net(bob.clone());

        producer.disconnect(&bob);
        let reconnect = {
            let producer = producer.clone();
            let bob = bob.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                producer.reconnect(&bob);
            })
        };
        outbox
            .send(&NetworkValue::<ReferenceScheme>::ComputeClosed, &bob)
            .await
            .unwrap();
        reconnect.await.unwrap();
        let (sender, bytes) = net_bob.receive().await.unwrap();
        assert_eq!(sender, alice);
        assert!(matches!(
            NetworkValue::<ReferenceScheme>::from_network(&bytes).unwrap(),
            NetworkValue::ComputeClosed
        ));
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_receiver_unreachable() {
        let alice = NodeId::from("alice");
        let bob = NodeId::from("bob");
        let producer = LocalNetworkingProducer::from_nodes([&alice, &bob]);
        let outbox = Outbox::new(Arc::new(producer.user_net(alice)), fast_retry());

        producer.disconnect(&bob);
        let failed = outbox
            .broadcast(&NetworkValue::<ReferenceScheme>::ComputeClosed, [&bob])
            .await;
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            &failed[0].1,
            TransportError::Unreachable { node, .. } if *node == bob
        ));
    }
}
