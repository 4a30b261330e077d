use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use aes_prng::AesRng;
use async_cell::sync::AsyncCell;
use dashmap::DashMap;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use super::operand_store::OperandStore;
use super::{CircuitDescriptor, CircuitId, DecOptions, InputProvider, OperandLabel, Output};
use crate::error::{CircuitError, ProtocolError};
use crate::execution::keys::KeyMaterialManager;
use crate::execution::protocols::executor::ProtocolExecutor;
use crate::execution::protocols::{ProtocolInput, ProtocolKind, ProtocolRole};
use crate::execution::runtime::party::NodeId;
use crate::networking::sending::Outbox;
use crate::networking::value::NetworkValue;
use crate::scheme::{AggregatedResult, MheScheme};

/// A ciphertext together with the label it lives under.
#[derive(Clone, Debug)]
pub struct Operand<S: MheScheme> {
    pub label: OperandLabel,
    pub ciphertext: S::Ciphertext,
}

type InputCell<S> = Arc<AsyncCell<Result<<S as MheScheme>::Ciphertext, String>>>;

/// Encrypts the input `label` of `circuit` as provided by the owning node's application.
pub async fn encrypt_input<S: MheScheme>(
    keys: &KeyMaterialManager<S>,
    provider: &dyn InputProvider,
    circuit: &CircuitId,
    label: &OperandLabel,
) -> Result<S::Ciphertext, String> {
    let values = provider
        .provide(circuit, label)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "input declined by its owner".to_string())?;
    let public_key = keys
        .completed_public_key()
        .ok_or_else(|| "collective public key is not available".to_string())?;
    let scheme = keys.executor().session().scheme();
    let plaintext = scheme.encode(&values).map_err(|e| e.to_string())?;
    let mut rng = AesRng::from_entropy();
    scheme
        .encrypt(&public_key, &plaintext, &mut rng)
        .map_err(|e| e.to_string())
}

/// Requests encrypted inputs from their owners on behalf of the circuits of the evaluator.
pub struct InputBroker<S: MheScheme> {
    outbox: Outbox,
    pending: DashMap<(CircuitId, OperandLabel), InputCell<S>>,
    local: Option<Arc<dyn InputProvider>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<S: MheScheme> InputBroker<S> {
    pub fn new(
        outbox: Outbox,
        local: Option<Arc<dyn InputProvider>>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        InputBroker {
            outbox,
            pending: DashMap::new(),
            local,
            timeout,
            cancel,
        }
    }

    pub async fn request(
        &self,
        keys: &KeyMaterialManager<S>,
        circuit: &CircuitId,
        label: &OperandLabel,
    ) -> Result<S::Ciphertext, CircuitError> {
        let missing = |reason: String| CircuitError::MissingInput {
            label: label.clone(),
            reason,
        };
        let owner = label
            .owner_node()
            .ok_or_else(|| missing("label has no owner".to_string()))?;

        if &owner == self.outbox.owner() {
            let provider = self
                .local
                .as_ref()
                .ok_or_else(|| missing("no local input provider".to_string()))?;
            return encrypt_input(keys, provider.as_ref(), circuit, label)
                .await
                .map_err(missing);
        }

        let key = (circuit.clone(), label.clone());
        let cell: InputCell<S> = AsyncCell::shared();
        self.pending.insert(key.clone(), Arc::clone(&cell));
        let request = NetworkValue::<S>::InputRequest {
            circuit: circuit.clone(),
            label: label.clone(),
        };
        if let Err(e) = self.outbox.send(&request, &owner).await {
            self.pending.remove(&key);
            return Err(missing(e.to_string()));
        }
        let response = tokio::select! {
            _ = self.cancel.cancelled() => Err(CircuitError::Cancelled),
            response = tokio::time::timeout(self.timeout, cell.get()) => {
                response.map_err(|_| missing(format!("no answer from {owner} within {:?}", self.timeout)))
            }
        };
        self.pending.remove(&key);
        response?.map_err(missing)
    }

    /// Completes a pending request with the owner's answer.
    pub fn fulfil(
        &self,
        sender: &NodeId,
        circuit: CircuitId,
        label: OperandLabel,
        result: Result<S::Ciphertext, String>,
    ) {
        if label.owner() != Some(sender.as_str()) {
            tracing::warn!("Ignoring input {label} sent by {sender}, who does not own it");
            return;
        }
        match self.pending.remove(&(circuit, label)) {
            Some(((_, label), cell)) => {
                tracing::debug!("Received input {label}");
                cell.set(result);
            }
            None => tracing::debug!("Dropping unrequested input from {sender}"),
        }
    }
}

/// Everything a circuit evaluation needs on the evaluator node.
pub struct CircuitContext<S: MheScheme> {
    pub keys: Arc<KeyMaterialManager<S>>,
    pub executor: Arc<ProtocolExecutor<S>>,
    pub store: Arc<OperandStore<S>>,
    pub inputs: Arc<InputBroker<S>>,
}

/// Execution environment of a single circuit.
///
/// Operands created by the circuit are buffered and only reach the [OperandStore] through
/// [CircuitRuntime::commit], once the circuit has completed.
pub struct CircuitRuntime<S: MheScheme> {
    context: Arc<CircuitContext<S>>,
    descriptor: CircuitDescriptor,
    writes: BTreeMap<OperandLabel, S::Ciphertext>,
    outputs: Vec<Output>,
}

impl<S: MheScheme> CircuitRuntime<S> {
    pub fn new(context: Arc<CircuitContext<S>>, descriptor: CircuitDescriptor) -> Self {
        CircuitRuntime {
            context,
            descriptor,
            writes: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> &CircuitDescriptor {
        &self.descriptor
    }

    pub fn scheme(&self) -> &S {
        self.context.executor.session().scheme()
    }

    pub fn slots(&self) -> usize {
        self.scheme().slots()
    }

    /// Node playing `role` in this circuit.
    pub fn node(&self, role: &str) -> Result<NodeId, CircuitError> {
        self.descriptor
            .node_mapping
            .get(role)
            .cloned()
            .ok_or_else(|| CircuitError::UnknownRole(role.to_string()))
    }

    pub fn resolve(&self, label: &OperandLabel) -> OperandLabel {
        label.resolve(&self.descriptor.node_mapping)
    }

    fn allocate(&mut self, label: OperandLabel, ciphertext: S::Ciphertext) -> Result<Operand<S>, CircuitError> {
        if self.writes.contains_key(&label) || self.context.store.contains(&label) {
            return Err(CircuitError::DuplicateOperand(label));
        }
        self.writes.insert(label.clone(), ciphertext.clone());
        Ok(Operand { label, ciphertext })
    }

    /// Waits for the owner of `label` to supply it.
    pub async fn input(&mut self, label: impl Into<OperandLabel>) -> Result<Operand<S>, CircuitError> {
        let label = self.resolve(&label.into());
        let ciphertext = self
            .context
            .inputs
            .request(&self.context.keys, &self.descriptor.id, &label)
            .await?;
        let scoped = label.scoped(&self.descriptor.id);
        self.allocate(scoped, ciphertext)
    }

    /// Reads a session-level operand.
    pub async fn load(&self, label: impl Into<OperandLabel>) -> Result<Operand<S>, CircuitError> {
        let label = self.resolve(&label.into());
        let ciphertext = self.context.store.get(&label).await?;
        Ok(Operand { label, ciphertext })
    }

    /// Stores `ciphertext` under a fresh label of this circuit.
    pub fn new_operand(
        &mut self,
        label: impl Into<OperandLabel>,
        ciphertext: S::Ciphertext,
    ) -> Result<Operand<S>, CircuitError> {
        let label = self.resolve(&label.into()).scoped(&self.descriptor.id);
        self.allocate(label, ciphertext)
    }

    /// Runs non-interactive operations with exactly the declared evaluation keys.
    pub fn eval_local<T>(
        &self,
        needs_relin: bool,
        rotations: &[usize],
        f: impl FnOnce(&S::Evaluator) -> anyhow::Result<T>,
    ) -> Result<T, CircuitError> {
        let evaluator = self.context.keys.evaluator(needs_relin, rotations)?;
        f(&evaluator).map_err(|e| CircuitError::InternalCryptoFailure(e.to_string()))
    }

    /// Collectively decrypts `operand` towards `receiver`.
    ///
    /// When the receiver is the evaluator itself, the output is reported with the circuit's
    /// results. Any other receiver gets it directly from the decryption protocol.
    pub async fn dec(
        &mut self,
        operand: &Operand<S>,
        receiver: &NodeId,
        options: &DecOptions,
    ) -> Result<(), CircuitError> {
        let executor = &self.context.executor;
        let session = executor.session();
        if !session.is_session_node(receiver) && receiver != session.helper_id() {
            return Err(CircuitError::UnknownRole(receiver.to_string()));
        }
        let kind = ProtocolKind::CollectiveDecrypt {
            operand: operand.label.clone(),
            receiver: receiver.clone(),
        };
        let descriptor = executor.descriptor(kind.clone())?;
        let input = ProtocolInput::Decrypt {
            ciphertext: operand.ciphertext.clone(),
            smudging: options.smudging,
        };
        match executor.run(descriptor, ProtocolRole::Aggregator, input).await? {
            AggregatedResult::Plaintext(plaintext) => {
                let values = self.scheme().decode(&plaintext);
                self.outputs.push(Output {
                    label: operand.label.clone(),
                    receiver: receiver.clone(),
                    values,
                });
                Ok(())
            }
            AggregatedResult::Withheld => {
                tracing::debug!("Decryption of {} delivered to {receiver}", operand.label);
                Ok(())
            }
            other => Err(ProtocolError::Crypto(format!(
                "protocol {kind} produced a {} result",
                other.kind_name()
            ))
            .into()),
        }
    }

    /// Publishes the buffered operands and returns the outputs of the circuit.
    pub fn commit(self) -> Result<Vec<Output>, CircuitError> {
        for (label, ciphertext) in self.writes {
            self.context.store.put(label, ciphertext)?;
        }
        Ok(self.outputs)
    }
}
