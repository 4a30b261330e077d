//! A node of a threshold session: the helper running setup and compute, or a party.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aes_prng::AesRng;
use rand::SeedableRng;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::error::{CircuitError, ConfigError, NodeError, TransportError};
use crate::execution::circuits::operand_store::OperandStore;
use crate::execution::circuits::runtime::{encrypt_input, CircuitContext, InputBroker};
use crate::execution::circuits::{CircuitRegistry, InputProvider, OperandLabel, Output};
use crate::execution::compute::{self, CircuitQueue, ComputeConfig, ComputeEvent, ComputeHandle};
use crate::execution::keys::{KeyMaterialManager, SetupDescription};
use crate::execution::protocols::executor::{ExecutorConfig, ProtocolExecutor, ProtocolResult};
use crate::execution::protocols::ProtocolKind;
use crate::execution::runtime::party::NodeId;
use crate::execution::runtime::session::{Session, SessionParameters};
use crate::networking::sending::{Outbox, RetryConfig};
use crate::networking::value::NetworkValue;
use crate::networking::NetworkingImpl;
use crate::scheme::{AggregatedResult, MheScheme};

/// Immutable configuration of a node, fixed at construction.
#[derive(Clone, Debug)]
pub struct NodeConfig<P> {
    pub id: NodeId,
    pub helper: NodeId,
    pub session: SessionParameters<P>,
    pub setup: ExecutorConfig,
    pub compute: ComputeConfig,
    pub retry: RetryConfig,
}

/// What the application runs on top of the session.
pub struct App<S: MheScheme> {
    pub setup: SetupDescription,
    pub circuits: CircuitRegistry<S>,
}

pub struct Node<S: MheScheme> {
    session: Arc<Session<S>>,
    outbox: Outbox,
    keys: Arc<KeyMaterialManager<S>>,
    compute: Arc<ProtocolExecutor<S>>,
    store: Arc<OperandStore<S>>,
    config: ComputeConfig,
    cancel: CancellationToken,
    compute_cancel: CancellationToken,
    started: AtomicBool,
}

impl<S: MheScheme> Node<S> {
    pub fn new(
        config: NodeConfig<S::Parameters>,
        secret: Option<S::SecretShare>,
        net: NetworkingImpl,
    ) -> Result<Self, ConfigError> {
        if net.owner() != &config.id {
            return Err(ConfigError::MissingNodeIdentity(format!(
                "transport belongs to {}, not to {}",
                net.owner(),
                config.id
            )));
        }
        let session = Arc::new(Session::new(
            config.session,
            config.id,
            config.helper,
            secret,
        )?);
        let outbox = Outbox::new(net, config.retry);
        let cancel = CancellationToken::new();
        let compute_cancel = cancel.child_token();

        let setup = Arc::new(ProtocolExecutor::new(
            Arc::clone(&session),
            config.setup,
            outbox.clone(),
            cancel.clone(),
        ));
        let compute = Arc::new(ProtocolExecutor::new(
            Arc::clone(&session),
            config.compute.executor.clone(),
            outbox.clone(),
            compute_cancel.clone(),
        ));
        let store = Arc::new(OperandStore::new(
            config.compute.read_policy,
            config.compute.read_timeout,
            cancel.clone(),
        ));
        tracing::info!(
            "Node {} ready in session {} ({} nodes, threshold {})",
            session.own_id(),
            session.name(),
            session.num_nodes(),
            session.threshold()
        );
        Ok(Node {
            session,
            outbox,
            keys: Arc::new(KeyMaterialManager::new(setup)),
            compute,
            store,
            config: config.compute,
            cancel,
            compute_cancel,
            started: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Arc<Session<S>> {
        &self.session
    }

    pub fn keys(&self) -> &Arc<KeyMaterialManager<S>> {
        &self.keys
    }

    fn mark_started(&self) -> Result<(), NodeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }
        Ok(())
    }

    fn spawn_router(
        &self,
        inputs: Option<Arc<InputBroker<S>>>,
        provider: Option<Arc<dyn InputProvider>>,
        events: Option<UnboundedSender<ComputeEvent>>,
    ) {
        let router = Router {
            outbox: self.outbox.clone(),
            setup: Arc::clone(self.keys.executor()),
            compute: Arc::clone(&self.compute),
            keys: Arc::clone(&self.keys),
            inputs,
            provider,
            events,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(router.run());
    }

    /// Runs the helper: setup first, then the compute phase.
    ///
    /// Returns the queue to submit circuits to, the handle to stop the compute phase and the
    /// delivery stream of the outputs the helper receives.
    pub async fn run_server(
        &self,
        app: App<S>,
        provider: Option<Arc<dyn InputProvider>>,
    ) -> Result<(CircuitQueue, ComputeHandle, UnboundedReceiver<ComputeEvent>), NodeError> {
        if !self.session.is_helper() {
            return Err(ConfigError::MissingNodeIdentity(format!(
                "{} is not the helper of the session",
                self.session.own_id()
            ))
            .into());
        }
        self.mark_started()?;

        let inputs = Arc::new(InputBroker::new(
            self.outbox.clone(),
            provider.clone(),
            self.config.input_timeout,
            self.compute_cancel.clone(),
        ));
        self.spawn_router(Some(Arc::clone(&inputs)), provider, None);

        self.keys.run_setup(&app.setup).await?;

        let context = Arc::new(CircuitContext {
            keys: Arc::clone(&self.keys),
            executor: Arc::clone(&self.compute),
            store: Arc::clone(&self.store),
            inputs,
        });
        let (sender, events) = unbounded_channel();
        let (queue, handle) = compute::start(
            context,
            Arc::new(app.circuits),
            &self.config,
            self.outbox.clone(),
            sender,
            self.compute_cancel.clone(),
        );
        Ok((queue, handle, events))
    }

    /// Runs a party until the setup keys are available, then serves the helper in the background.
    pub async fn run_client(
        &self,
        app: App<S>,
        provider: Arc<dyn InputProvider>,
    ) -> Result<UnboundedReceiver<ComputeEvent>, NodeError> {
        if self.session.is_helper() {
            return Err(ConfigError::MissingNodeIdentity(format!(
                "{} is the helper of the session",
                self.session.own_id()
            ))
            .into());
        }
        let helper = self.session.helper_id();
        if !self.outbox.is_reachable(helper) {
            return Err(TransportError::Unreachable {
                node: helper.clone(),
                reason: "no link to the helper".to_string(),
            }
            .into());
        }
        self.mark_started()?;

        let (sender, events) = unbounded_channel();
        self.spawn_router(None, Some(provider), Some(sender));
        self.keys.await_setup(&app.setup).await?;
        tracing::info!("Setup keys available on {}", self.session.own_id());
        Ok(events)
    }

    /// Loads a session-level operand, visible to every circuit.
    pub fn put_operand(
        &self,
        label: impl Into<OperandLabel>,
        ciphertext: S::Ciphertext,
    ) -> Result<(), CircuitError> {
        self.store.put(label.into(), ciphertext)
    }

    pub fn collective_public_key(&self) -> Option<S::PublicKey> {
        self.keys.completed_public_key()
    }

    /// Encrypts `values` under the collective public key.
    pub fn encrypt(&self, values: &[u64]) -> Result<S::Ciphertext, CircuitError> {
        let public_key = self
            .collective_public_key()
            .ok_or_else(|| CircuitError::MissingKeyMaterial("collective public key".to_string()))?;
        let scheme = self.session.scheme();
        let plaintext = scheme
            .encode(values)
            .map_err(|e| CircuitError::InternalCryptoFailure(e.to_string()))?;
        let mut rng = AesRng::from_entropy();
        scheme
            .encrypt(&public_key, &plaintext, &mut rng)
            .map_err(|e| CircuitError::InternalCryptoFailure(e.to_string()))
    }

    /// Aborts every pending wait of the session.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.session.own_id());
        self.cancel.cancel();
    }
}

/// Dispatches incoming messages to the executors, the input broker and the delivery stream.
struct Router<S: MheScheme> {
    outbox: Outbox,
    setup: Arc<ProtocolExecutor<S>>,
    compute: Arc<ProtocolExecutor<S>>,
    keys: Arc<KeyMaterialManager<S>>,
    inputs: Option<Arc<InputBroker<S>>>,
    provider: Option<Arc<dyn InputProvider>>,
    events: Option<UnboundedSender<ComputeEvent>>,
    cancel: CancellationToken,
}

impl<S: MheScheme> Router<S> {
    fn executor(&self, kind: &ProtocolKind) -> &Arc<ProtocolExecutor<S>> {
        match kind.is_setup() {
            true => &self.setup,
            false => &self.compute,
        }
    }

    async fn run(mut self) {
        let net = Arc::clone(self.outbox.networking());
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = net.receive() => received,
            };
            let (sender, bytes) = match received {
                Ok(received) => received,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::warn!("Receive failed: {e}");
                    continue;
                }
            };
            match NetworkValue::<S>::from_network(&bytes) {
                Ok(value) => self.route(sender, value),
                Err(e) => tracing::warn!("Dropping undecodable message from {sender}: {e}"),
            }
        }
        tracing::debug!("Router of {} stopped", self.outbox.owner());
    }

    fn route(&mut self, sender: NodeId, value: NetworkValue<S>) {
        match value {
            NetworkValue::ProtocolRequest { ref descriptor, .. } => {
                let executor = Arc::clone(self.executor(&descriptor.kind));
                executor.handle_message(sender, value);
            }
            NetworkValue::Aggregate { ref kind, .. } => {
                let executor = Arc::clone(self.executor(kind));
                if let Some((kind, result)) = executor.handle_message(sender, value) {
                    self.deliver(kind, result);
                }
            }
            NetworkValue::Share { protocol, .. } => {
                let executor = match self.setup.has_open_round(&protocol) {
                    true => Arc::clone(&self.setup),
                    false => Arc::clone(&self.compute),
                };
                executor.handle_message(sender, value);
            }
            NetworkValue::InputRequest { circuit, label } => {
                let outbox = self.outbox.clone();
                let keys = Arc::clone(&self.keys);
                let provider = self.provider.clone();
                tokio::spawn(async move {
                    let result = match provider {
                        Some(_) if label.owner() != Some(outbox.owner().as_str()) => {
                            Err(format!("{} does not own {label}", outbox.owner()))
                        }
                        Some(provider) => {
                            encrypt_input(&keys, provider.as_ref(), &circuit, &label).await
                        }
                        None => Err("no input provider".to_string()),
                    };
                    if let Err(reason) = &result {
                        tracing::warn!("Declining input {label} of circuit {circuit}: {reason}");
                    }
                    let response = NetworkValue::<S>::InputResponse {
                        circuit,
                        label,
                        result,
                    };
                    if let Err(e) = outbox.send(&response, &sender).await {
                        tracing::warn!("Could not answer input request of {sender}: {e}");
                    }
                });
            }
            NetworkValue::InputResponse {
                circuit,
                label,
                result,
            } => match &self.inputs {
                Some(inputs) => inputs.fulfil(&sender, circuit, label, result),
                None => tracing::warn!("Unexpected input response from {sender}"),
            },
            NetworkValue::ComputeClosed => {
                if &sender == self.keys.executor().session().helper_id() {
                    tracing::info!("Compute phase closed by {sender}");
                    self.events = None;
                } else {
                    tracing::warn!("Ignoring end of compute sent by {sender}");
                }
            }
        }
    }

    /// Pushes the outcome of a decryption towards this node onto the delivery stream.
    fn deliver(&self, kind: ProtocolKind, result: ProtocolResult<S>) {
        let ProtocolKind::CollectiveDecrypt { operand, receiver } = kind else {
            return;
        };
        if &receiver != self.outbox.owner() {
            return;
        }
        let label = operand.clone();
        let event = match result {
            Ok(AggregatedResult::Plaintext(plaintext)) => ComputeEvent::Output(Output {
                label: operand,
                receiver,
                values: self.compute.session().scheme().decode(&plaintext),
            }),
            Ok(other) => {
                tracing::debug!("Decryption of {operand} ended with {}", other.kind_name());
                return;
            }
            Err(cause) => ComputeEvent::DecryptionFailed {
                label: operand,
                cause,
            },
        };
        match &self.events {
            Some(events) => {
                let _ = events.send(event);
            }
            None => tracing::warn!("Delivery stream already closed, dropping result of {label}"),
        }
    }
}
