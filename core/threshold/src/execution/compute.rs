//! Dispatch of circuit descriptors on the evaluator and delivery of their outputs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use super::circuits::operand_store::ReadPolicy;
use super::circuits::runtime::{CircuitContext, CircuitRuntime};
use super::circuits::{CircuitDescriptor, CircuitId, CircuitRegistry, OperandLabel, Output};
use super::protocols::executor::ExecutorConfig;
use crate::error::{CircuitError, DispatchError, ProtocolError};
use crate::networking::sending::Outbox;
use crate::networking::value::NetworkValue;
use crate::scheme::MheScheme;

/// Event on the per-node delivery stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ComputeEvent {
    Output(Output),
    CircuitFailed {
        circuit: CircuitId,
        cause: CircuitError,
    },
    /// A decryption towards this node failed.
    DecryptionFailed {
        label: OperandLabel,
        cause: ProtocolError,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComputeConfig {
    /// Bounds of the executor running the decryptions.
    pub executor: ExecutorConfig,
    pub max_circuit_evaluation: usize,
    pub queue_capacity: usize,
    pub input_timeout: Duration,
    pub read_policy: ReadPolicy,
    pub read_timeout: Duration,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        ComputeConfig {
            executor: ExecutorConfig::default(),
            max_circuit_evaluation: 4,
            queue_capacity: 32,
            input_timeout: Duration::from_secs(10),
            read_policy: ReadPolicy::Block,
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// Producer side of the circuit queue.
#[derive(Clone)]
pub struct CircuitQueue {
    sender: Arc<Mutex<Option<mpsc::Sender<CircuitDescriptor>>>>,
    seen: Arc<DashSet<CircuitId>>,
}

impl CircuitQueue {
    /// Enqueues a descriptor, waiting for room in the queue.
    pub async fn submit(&self, descriptor: CircuitDescriptor) -> Result<(), DispatchError> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or(DispatchError::Closed)?;
        if !self.seen.insert(descriptor.id.clone()) {
            tracing::warn!("Rejecting duplicate circuit {}", descriptor.id);
            return Err(DispatchError::DuplicateCircuit(descriptor.id));
        }
        tracing::debug!("Queueing circuit {descriptor}");
        sender
            .send(descriptor)
            .await
            .map_err(|_| DispatchError::Closed)
    }

    /// No descriptor is accepted afterwards. Queued ones are still evaluated.
    pub async fn close(&self) {
        if self.sender.lock().await.take().is_some() {
            tracing::info!("Circuit queue closed");
        }
    }
}

pub struct ComputeHandle {
    queue: CircuitQueue,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl ComputeHandle {
    /// Closes the queue and waits for every accepted circuit to deliver its outputs.
    pub async fn graceful_stop(self) {
        self.queue.close().await;
        if let Err(e) = self.supervisor.await {
            tracing::error!("Compute supervisor failed: {e}");
        }
    }

    /// Cancels the circuits in flight and closes the streams.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.queue.close().await;
        if let Err(e) = self.supervisor.await {
            tracing::error!("Compute supervisor failed: {e}");
        }
    }
}

#[instrument(skip_all, fields(circuit = %descriptor.id))]
async fn evaluate<S: MheScheme>(
    context: Arc<CircuitContext<S>>,
    registry: &CircuitRegistry<S>,
    descriptor: CircuitDescriptor,
    cancel: &CancellationToken,
) -> Result<Vec<Output>, CircuitError> {
    let own = context.executor.session().own_id().clone();
    if descriptor.evaluator != own {
        return Err(CircuitError::EvaluatorMismatch {
            expected: descriptor.evaluator,
            actual: own,
        });
    }
    let circuit = registry
        .get(&descriptor.name)
        .ok_or_else(|| CircuitError::UnknownCircuit(descriptor.name.clone()))?;

    tracing::info!("Evaluating circuit {descriptor}");
    let mut rt = CircuitRuntime::new(context, descriptor);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CircuitError::Cancelled),
        evaluated = circuit.evaluate(&mut rt) => evaluated?,
    }
    rt.commit()
}

/// Starts the evaluation workers. The delivery stream behind `events` is closed once the queue
/// is closed and drained, or on cancellation.
pub fn start<S: MheScheme>(
    context: Arc<CircuitContext<S>>,
    registry: Arc<CircuitRegistry<S>>,
    config: &ComputeConfig,
    outbox: Outbox,
    events: UnboundedSender<ComputeEvent>,
    cancel: CancellationToken,
) -> (CircuitQueue, ComputeHandle) {
    let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
    let queue = CircuitQueue {
        sender: Arc::new(Mutex::new(Some(sender))),
        seen: Arc::new(DashSet::new()),
    };
    let receiver = Arc::new(Mutex::new(receiver));

    let tracker = TaskTracker::new();
    for worker in 0..config.max_circuit_evaluation.max(1) {
        let context = Arc::clone(&context);
        let registry = Arc::clone(&registry);
        let receiver = Arc::clone(&receiver);
        let events = events.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                let next = {
                    let mut receiver = receiver.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        next = receiver.recv() => next,
                    }
                };
                let Some(descriptor) = next else {
                    break;
                };
                let circuit = descriptor.id.clone();
                match evaluate(Arc::clone(&context), &registry, descriptor, &cancel).await {
                    Ok(outputs) => {
                        tracing::info!("Circuit {circuit} completed with {} outputs", outputs.len());
                        for output in outputs {
                            let _ = events.send(ComputeEvent::Output(output));
                        }
                    }
                    Err(cause) => {
                        tracing::error!("Circuit {circuit} failed: {cause}");
                        let _ = events.send(ComputeEvent::CircuitFailed { circuit, cause });
                    }
                }
            }
            tracing::debug!("Compute worker {worker} stopped");
        });
    }
    tracker.close();

    let session = Arc::clone(context.executor.session());
    let supervisor = tokio::spawn(async move {
        tracker.wait().await;
        let failures = outbox
            .broadcast(&NetworkValue::<S>::ComputeClosed, session.nodes())
            .await;
        for (node, e) in failures {
            tracing::warn!("Could not notify {node} of the end of compute: {e}");
        }
        drop(events);
        tracing::info!("Compute phase closed");
    });

    let handle = ComputeHandle {
        queue: queue.clone(),
        cancel,
        supervisor,
    };
    (queue, handle)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::execution::circuits::operand_store::OperandStore;
    use crate::execution::circuits::runtime::InputBroker;
    use crate::execution::circuits::Circuit;
    use crate::execution::keys::KeyMaterialManager;
    use crate::execution::protocols::executor::ProtocolExecutor;
    use crate::execution::runtime::party::{generate_node_ids, NodeId};
    use crate::execution::runtime::session::{Session, SessionParameters};
    use crate::networking::local::LocalNetworkingProducer;
    use crate::networking::sending::RetryConfig;
    use crate::networking::NetworkingImpl;
    use crate::scheme::reference::{ReferenceParameters, ReferenceScheme};

    struct Recording(Arc<AtomicBool>);

    #[async_trait]
    impl Circuit<ReferenceScheme> for Recording {
        async fn evaluate(&self, _rt: &mut CircuitRuntime<ReferenceScheme>) -> Result<(), CircuitError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn helper_context(cancel: &CancellationToken) -> (Arc<CircuitContext<ReferenceScheme>>, Outbox) {
        let nodes = generate_node_ids(2);
        let helper = NodeId::from("cloud");
        let parameters = SessionParameters {
            name: "compute-test".to_string(),
            public_points: nodes
                .iter()
                .enumerate()
                .map(|(i, node)| (node.clone(), i as u64 + 1))
                .collect(),
            nodes: nodes.clone(),
            threshold: 2,
            public_seed: b"compute".to_vec(),
            scheme: ReferenceParameters::default(),
        };
        let producer = LocalNetworkingProducer::from_nodes(nodes.iter().chain([&helper]));
        let net: NetworkingImpl = Arc::new(producer.user_net(helper.clone()));
        let outbox = Outbox::new(net, RetryConfig::default());
        let session = Session::new(parameters, helper.clone(), helper, None).unwrap();
        let executor = Arc::new(ProtocolExecutor::new(
            Arc::new(session),
            ExecutorConfig::default(),
            outbox.clone(),
            cancel.clone(),
        ));
        let context = CircuitContext {
            keys: Arc::new(KeyMaterialManager::new(Arc::clone(&executor))),
            executor,
            store: Arc::new(OperandStore::new(
                ReadPolicy::Block,
                Duration::from_secs(1),
                cancel.clone(),
            )),
            inputs: Arc::new(InputBroker::new(
                outbox.clone(),
                None,
                Duration::from_secs(1),
                cancel.clone(),
            )),
        };
        (Arc::new(context), outbox)
    }

    fn recording(evaluated: &Arc<AtomicBool>) -> CircuitRegistry<ReferenceScheme> {
        let mut registry = CircuitRegistry::default();
        registry.register("recording", Arc::new(Recording(Arc::clone(evaluated))));
        registry
    }

    fn descriptor(id: &str) -> CircuitDescriptor {
        CircuitDescriptor {
            name: "recording".to_string(),
            id: CircuitId::from(id),
            node_mapping: BTreeMap::new(),
            evaluator: NodeId::from("cloud"),
        }
    }

    #[tokio::test]
    async fn cancelled_evaluation_never_runs_the_circuit() {
        let cancel = CancellationToken::new();
        let (context, _) = helper_context(&cancel);
        let evaluated = Arc::new(AtomicBool::new(false));
        let registry = recording(&evaluated);
        cancel.cancel();

        for _ in 0..16 {
            let result = evaluate(Arc::clone(&context), &registry, descriptor("c-0"), &cancel).await;
            assert_eq!(result, Err(CircuitError::Cancelled));
        }
        assert!(!evaluated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_workers_leave_the_queue_untouched() {
        let cancel = CancellationToken::new();
        let (context, outbox) = helper_context(&cancel);
        let evaluated = Arc::new(AtomicBool::new(false));
        let (sender, mut events) = mpsc::unbounded_channel();
        cancel.cancel();

        let (queue, handle) = start(
            context,
            Arc::new(recording(&evaluated)),
            &ComputeConfig::default(),
            outbox,
            sender,
            cancel.clone(),
        );
        for c in 0..4 {
            queue.submit(descriptor(&format!("c-{c}"))).await.unwrap();
        }
        handle.shutdown().await;

        assert_eq!(events.recv().await, None);
        assert!(!evaluated.load(Ordering::SeqCst));
    }
}
