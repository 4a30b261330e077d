use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use aes_prng::AesRng;
use dashmap::{DashMap, DashSet};
use itertools::Itertools;
use rand::{RngCore, SeedableRng};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedSender},
    Semaphore, SemaphorePermit,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::result_store::{ResultCell, ResultStore};
use super::{
    ProtocolDescriptor, ProtocolId, ProtocolInput, ProtocolKind, ProtocolRole, ProtocolStatus,
};
use crate::error::ProtocolError;
use crate::execution::runtime::party::NodeId;
use crate::execution::runtime::session::Session;
use crate::networking::sending::Outbox;
use crate::networking::value::NetworkValue;
use crate::scheme::{AggregatedResult, MheScheme, ShareInput};

pub type ProtocolResult<S> = Result<AggregatedResult<S>, ProtocolError>;

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorConfig {
    /// Protocol instances this node is active in at the same time. A participant stays active
    /// from computing its share until the outcome of the instance arrives.
    pub max_proto_per_node: usize,
    /// Instances in which this node concurrently computes a share.
    pub max_participation: usize,
    /// Instances this node concurrently aggregates.
    pub max_aggregation: usize,
    pub round_timeout: Duration,
    /// Rounds an aggregator runs before giving up on an instance.
    pub max_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_proto_per_node: 16,
            max_participation: 16,
            max_aggregation: 8,
            round_timeout: Duration::from_secs(10),
            max_attempts: 1,
        }
    }
}

struct RoundFailure {
    error: ProtocolError,
    /// Contributors that did not answer in time.
    silent: BTreeSet<NodeId>,
}

impl From<ProtocolError> for RoundFailure {
    fn from(error: ProtocolError) -> Self {
        RoundFailure {
            error,
            silent: BTreeSet::new(),
        }
    }
}

type IncomingShare<S> = (NodeId, <S as MheScheme>::Share);

fn crypto(err: anyhow::Error) -> ProtocolError {
    ProtocolError::Crypto(err.to_string())
}

/// Runs the protocol instances of one session phase on this node, as aggregator or participant.
///
/// Results are cached by [ProtocolId] for the lifetime of the executor. Failed instances are
/// evicted, so the same descriptor can be issued again.
pub struct ProtocolExecutor<S: MheScheme> {
    session: Arc<Session<S>>,
    config: ExecutorConfig,
    outbox: Outbox,
    results: ResultStore<ProtocolId, AggregatedResult<S>, ProtocolError>,
    status: DashMap<ProtocolId, ProtocolStatus>,
    running: DashSet<ProtocolId>,
    // open rounds, keyed by instance, tagged with the nonce of the round
    share_inboxes: DashMap<ProtocolId, (u64, UnboundedSender<IncomingShare<S>>)>,
    contributed: DashSet<(ProtocolId, u64)>,
    // participants of the decryptions this node has to finish itself
    receiving: DashMap<ProtocolId, BTreeSet<NodeId>>,
    active: Semaphore,
    participation: Semaphore,
    aggregation: Semaphore,
    cancel: CancellationToken,
}

impl<S: MheScheme> ProtocolExecutor<S> {
    pub fn new(
        session: Arc<Session<S>>,
        config: ExecutorConfig,
        outbox: Outbox,
        cancel: CancellationToken,
    ) -> Self {
        ProtocolExecutor {
            active: Semaphore::new(config.max_proto_per_node),
            participation: Semaphore::new(config.max_participation),
            aggregation: Semaphore::new(config.max_aggregation),
            session,
            config,
            outbox,
            results: ResultStore::default(),
            status: DashMap::new(),
            running: DashSet::new(),
            share_inboxes: DashMap::new(),
            contributed: DashSet::new(),
            receiving: DashMap::new(),
            cancel,
        }
    }

    pub fn session(&self) -> &Arc<Session<S>> {
        &self.session
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn protocol_id(&self, kind: &ProtocolKind) -> Result<ProtocolId, ProtocolError> {
        ProtocolId::derive(self.session.id(), kind).map_err(crypto)
    }

    /// Completed instances are only tracked by their cached result.
    pub fn status(&self, id: &ProtocolId) -> Option<ProtocolStatus> {
        match self.status.get(id) {
            Some(status) => Some(status.clone()),
            None => matches!(self.results.try_get(id), Some(Ok(_)))
                .then_some(ProtocolStatus::Completed),
        }
    }

    /// Cached result of an instance, if it has completed.
    pub fn completed(&self, id: &ProtocolId) -> Option<ProtocolResult<S>> {
        self.results.try_get(id)
    }

    /// Waits for the result of an instance run by someone else.
    pub async fn await_result(&self, id: &ProtocolId) -> ProtocolResult<S> {
        let (cell, _) = self.results.get_or_insert(id);
        self.await_cell(cell).await
    }

    pub fn has_open_round(&self, id: &ProtocolId) -> bool {
        self.open_round(id).is_some()
    }

    fn open_round(&self, id: &ProtocolId) -> Option<u64> {
        self.share_inboxes.get(id).map(|inbox| inbox.0)
    }

    /// Picks the first `t` reachable session nodes, in session order.
    ///
    /// The receiver of a decryption is always part of the set when it is a session node.
    pub fn select_participants(
        &self,
        kind: &ProtocolKind,
        excluded: &BTreeSet<NodeId>,
    ) -> Result<BTreeSet<NodeId>, ProtocolError> {
        let needed = self.session.threshold();
        let reachable = self
            .session
            .nodes()
            .iter()
            .filter(|node| !excluded.contains(*node) && self.outbox.is_reachable(node))
            .collect_vec();
        let insufficient = ProtocolError::InsufficientParticipants {
            available: reachable.len(),
            needed,
        };

        let mut selected = BTreeSet::new();
        if let ProtocolKind::CollectiveDecrypt { receiver, .. } = kind {
            if self.session.is_session_node(receiver) {
                if !reachable.contains(&receiver) {
                    return Err(insufficient);
                }
                selected.insert(receiver.clone());
            }
        }
        for node in reachable {
            if selected.len() >= needed {
                break;
            }
            selected.insert(node.clone());
        }
        if selected.len() < needed {
            return Err(insufficient);
        }
        Ok(selected)
    }

    /// Descriptor of an instance aggregated by this node over the currently reachable nodes.
    pub fn descriptor(&self, kind: ProtocolKind) -> Result<ProtocolDescriptor, ProtocolError> {
        let participants = self.select_participants(&kind, &BTreeSet::new())?;
        Ok(ProtocolDescriptor {
            kind,
            aggregator: self.session.own_id().clone(),
            participants,
        })
    }

    /// Runs an instance to completion.
    ///
    /// The aggregator reruns nothing once a result is cached. A participant waits for the
    /// aggregate; its own share is produced when the aggregator announces the instance.
    #[instrument(skip_all, fields(protocol = %descriptor.kind, node = %self.session.own_id()))]
    pub async fn run(
        &self,
        descriptor: ProtocolDescriptor,
        role: ProtocolRole,
        input: ProtocolInput<S>,
    ) -> ProtocolResult<S> {
        let id = self.protocol_id(&descriptor.kind)?;
        let (cell, _) = self.results.get_or_insert(&id);
        if let Some(result) = cell.try_get() {
            tracing::debug!("Serving {id} from cache");
            return result;
        }
        match role {
            ProtocolRole::Participant => self.await_cell(cell).await,
            ProtocolRole::Aggregator => {
                if &descriptor.aggregator != self.session.own_id() {
                    return Err(ProtocolError::NotAParticipant(self.session.own_id().clone()));
                }
                if !self.running.insert(id) {
                    tracing::debug!("{id} is already being aggregated");
                    return self.await_cell(cell).await;
                }
                let result = self.aggregate(id, descriptor, input).await;
                self.running.remove(&id);
                self.finish(id, result.clone());
                result
            }
        }
    }

    async fn aggregate(
        &self,
        id: ProtocolId,
        mut descriptor: ProtocolDescriptor,
        input: ProtocolInput<S>,
    ) -> ProtocolResult<S> {
        let _active = self.acquire(&self.active).await?;
        let _aggregation = self.acquire(&self.aggregation).await?;
        self.check_participants(&descriptor)?;

        let mut excluded = BTreeSet::new();
        let mut attempt = 1;
        loop {
            let outcome = self.aggregate_round(id, &descriptor, attempt, &input).await;
            self.share_inboxes.remove(&id);
            match outcome {
                Ok(result) => {
                    self.publish(id, &descriptor, Ok(&result)).await;
                    tracing::info!("Completed {id} in attempt {attempt}");
                    return Ok(match descriptor.local_receiver() {
                        Some(_) => AggregatedResult::Withheld,
                        None => result,
                    });
                }
                Err(RoundFailure { error, silent }) => {
                    let retryable = matches!(
                        error,
                        ProtocolError::Timeout { .. } | ProtocolError::Transport(_)
                    );
                    if !retryable || attempt >= self.config.max_attempts {
                        tracing::warn!("Instance {id} failed in attempt {attempt}: {error}");
                        self.publish(id, &descriptor, Err(&error)).await;
                        return Err(error);
                    }
                    tracing::warn!(
                        "Attempt {attempt} of {id} failed: {error}, excluding [{}]",
                        silent.iter().join(", ")
                    );
                    excluded.extend(silent);
                    attempt += 1;
                    descriptor.participants =
                        match self.select_participants(&descriptor.kind, &excluded) {
                            Ok(participants) => participants,
                            Err(error) => {
                                self.publish(id, &descriptor, Err(&error)).await;
                                return Err(error);
                            }
                        };
                }
            }
        }
    }

    async fn aggregate_round(
        &self,
        id: ProtocolId,
        descriptor: &ProtocolDescriptor,
        attempt: u32,
        input: &ProtocolInput<S>,
    ) -> Result<AggregatedResult<S>, RoundFailure> {
        self.set_status(id, ProtocolStatus::Pending);
        let share_input = self.share_input(&descriptor.kind, input)?;
        let contributors = descriptor.contributors();
        let needed = contributors.len();

        // drawn fresh for every round, participants echo it with their share
        let round = AesRng::from_entropy().next_u64();
        let (sender, mut receiver) = unbounded_channel();
        self.share_inboxes.insert(id, (round, sender));
        let request = NetworkValue::ProtocolRequest {
            descriptor: descriptor.clone(),
            attempt,
            round,
            input: input.clone(),
        };
        let unreachable = self
            .outbox
            .broadcast(&request, descriptor.participants.iter())
            .await;
        if let Some((_, err)) = unreachable.first() {
            return Err(RoundFailure {
                error: ProtocolError::Transport(err.clone()),
                silent: unreachable.iter().map(|(node, _)| node.clone()).collect(),
            });
        }
        self.set_status(id, ProtocolStatus::AwaitingShares);

        let deadline = Instant::now() + self.config.round_timeout;
        let mut shares = BTreeMap::new();
        while shares.len() < needed {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled.into()),
                _ = tokio::time::sleep_until(deadline) => {
                    let silent = contributors
                        .iter()
                        .filter(|node| !shares.contains_key(*node))
                        .cloned()
                        .collect();
                    return Err(RoundFailure {
                        error: ProtocolError::Timeout { received: shares.len(), needed },
                        silent,
                    });
                }
                incoming = receiver.recv() => {
                    let Some((sender, share)) = incoming else {
                        return Err(ProtocolError::Cancelled.into());
                    };
                    if !contributors.contains(&sender) {
                        let err = ProtocolError::InvalidShare { sender, reason: "not a contributor".to_string() };
                        tracing::warn!("Discarding share of {id}: {err}");
                        continue;
                    }
                    if shares.contains_key(&sender) {
                        tracing::debug!("Discarding duplicate share of {id} from {sender}");
                        continue;
                    }
                    if let Err(e) = self.session.scheme().check_share(&share_input, &share) {
                        let err = ProtocolError::InvalidShare { sender, reason: e.to_string() };
                        tracing::warn!("Discarding share of {id}: {err}");
                        continue;
                    }
                    shares.insert(sender, share);
                }
            }
        }

        self.set_status(id, ProtocolStatus::Aggregating);
        let shares = shares.into_values().collect_vec();
        self.session
            .scheme()
            .aggregate(&share_input, &shares)
            .map_err(|e| crypto(e).into())
    }

    /// Sends the outcome of an instance to the nodes entitled to it.
    ///
    /// Key material goes to every session node. A decryption result only reaches its receiver,
    /// the other participants get [AggregatedResult::Withheld].
    async fn publish(
        &self,
        id: ProtocolId,
        descriptor: &ProtocolDescriptor,
        result: Result<&AggregatedResult<S>, &ProtocolError>,
    ) {
        let message = |result: ProtocolResult<S>| NetworkValue::Aggregate {
            protocol: id,
            kind: descriptor.kind.clone(),
            result,
        };
        let mut failed = Vec::new();
        match result {
            _ if descriptor.kind.is_setup() => {
                let value = message(result.cloned().map_err(Clone::clone));
                failed.extend(self.outbox.broadcast(&value, self.session.nodes()).await);
            }
            Err(error) => {
                let value = message(Err(error.clone()));
                failed.extend(
                    self.outbox
                        .broadcast(&value, descriptor.participants.iter())
                        .await,
                );
            }
            Ok(aggregated) => {
                let receiver = descriptor.local_receiver();
                if let Some(receiver) = receiver {
                    if let Err(e) = self.outbox.send(&message(Ok(aggregated.clone())), receiver).await {
                        failed.push((receiver.clone(), e));
                    }
                }
                let others = descriptor
                    .participants
                    .iter()
                    .filter(|node| Some(*node) != receiver);
                failed.extend(
                    self.outbox
                        .broadcast(&message(Ok(AggregatedResult::Withheld)), others)
                        .await,
                );
            }
        }
        for (node, err) in failed {
            tracing::warn!("Could not deliver the outcome of {id} to {node}: {err}");
        }
    }

    /// Validates a request against the session. Returns the instance id when a share is due.
    fn accept_request(&self, descriptor: &ProtocolDescriptor) -> Result<Option<ProtocolId>, ProtocolError> {
        let own = self.session.own_id();
        if &descriptor.aggregator != self.session.helper_id() {
            return Err(ProtocolError::NotAParticipant(descriptor.aggregator.clone()));
        }
        if !descriptor.participants.contains(own) {
            return Err(ProtocolError::NotAParticipant(own.clone()));
        }
        self.check_participants(descriptor)?;
        let id = self.protocol_id(&descriptor.kind)?;
        let (cell, _) = self.results.get_or_insert(&id);
        if let Some(Ok(_)) = cell.try_get() {
            tracing::debug!("{id} already completed, ignoring request");
            return Ok(None);
        }
        if descriptor.local_receiver() == Some(own) {
            self.receiving.insert(id, descriptor.participants.clone());
            self.set_status(id, ProtocolStatus::AwaitingShares);
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Contributes this node's share to an instance announced by the aggregator.
    #[instrument(skip_all, fields(protocol = %descriptor.kind, node = %self.session.own_id(), attempt = attempt))]
    pub async fn participate(
        &self,
        descriptor: ProtocolDescriptor,
        attempt: u32,
        round: u64,
        input: ProtocolInput<S>,
    ) -> Result<(), ProtocolError> {
        let Some(id) = self.accept_request(&descriptor)? else {
            return Ok(());
        };
        if !self.contributed.insert((id, round)) {
            tracing::debug!("Already contributed to attempt {attempt} of {id}");
            return Ok(());
        }

        let _active = self.acquire(&self.active).await?;
        let share = {
            let _participation = self.acquire(&self.participation).await?;
            self.set_status(id, ProtocolStatus::Pending);
            let share_input = self.share_input(&descriptor.kind, &input)?;
            let secret = self
                .session
                .additive_secret(&descriptor.participants)
                .map_err(crypto)?;
            let mut rng = AesRng::from_entropy();
            self.session
                .scheme()
                .gen_share(&share_input, &secret, &mut rng)
                .map_err(crypto)?
        };
        let value = NetworkValue::<S>::Share {
            protocol: id,
            round,
            share,
        };
        let (cell, _) = self.results.get_or_insert(&id);
        self.set_status(id, ProtocolStatus::AwaitingShares);
        self.outbox.send(&value, &descriptor.aggregator).await?;
        tracing::debug!("Sent share of {id}");

        let patience = self.config.round_timeout * self.config.max_attempts;
        if tokio::time::timeout(patience, self.await_cell(cell)).await.is_err() {
            tracing::debug!("No outcome of {id} within {patience:?}, releasing the slot");
        }
        Ok(())
    }

    /// Hands a received share to the round collecting it.
    pub fn deliver_share(&self, sender: NodeId, id: ProtocolId, round: u64, share: S::Share) {
        match self.share_inboxes.get(&id) {
            Some(inbox) if inbox.0 != round => {
                tracing::debug!("Discarding share of {id} from {sender} for a stale round");
            }
            Some(inbox) => {
                if inbox.1.send((sender, share)).is_err() {
                    tracing::debug!("Round of {id} closed before the share arrived");
                }
            }
            None => tracing::debug!("Dropping share of {id} from {sender}: no open round"),
        }
    }

    /// Records an aggregate published by the aggregator and returns the local outcome.
    pub fn deliver_aggregate(
        &self,
        id: ProtocolId,
        kind: &ProtocolKind,
        result: ProtocolResult<S>,
    ) -> ProtocolResult<S> {
        if self.protocol_id(kind)? != id {
            return Err(ProtocolError::Crypto(format!(
                "aggregate {id} does not match kind {kind}"
            )));
        }
        if let Some(cached) = self.results.try_get(&id) {
            tracing::debug!("Ignoring repeated aggregate of {id}");
            return cached;
        }
        let result = match result {
            Ok(AggregatedResult::Switched(ciphertext)) => self.finish_decryption(&id, &ciphertext),
            other => other,
        };
        self.receiving.remove(&id);
        self.contributed.retain(|(protocol, _)| *protocol != id);
        self.finish(id, result.clone());
        result
    }

    /// Handles one protocol message from `sender`.
    ///
    /// Returns the kind and local outcome when the message completed an instance.
    pub fn handle_message(
        self: &Arc<Self>,
        sender: NodeId,
        value: NetworkValue<S>,
    ) -> Option<(ProtocolKind, ProtocolResult<S>)> {
        match value {
            NetworkValue::ProtocolRequest {
                descriptor,
                attempt,
                round,
                input,
            } => {
                if &sender != self.session.helper_id() {
                    tracing::warn!("Ignoring protocol request from {sender}");
                    return None;
                }
                // the receiver sends nothing, but must know it expects a result before the
                // aggregate arrives
                if descriptor.local_receiver() == Some(self.session.own_id()) {
                    if let Err(e) = self.accept_request(&descriptor) {
                        tracing::warn!("Rejecting decryption request: {e}");
                    }
                    return None;
                }
                let executor = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = executor.participate(descriptor, attempt, round, input).await {
                        tracing::warn!("Could not contribute a share: {e}");
                    }
                });
                None
            }
            NetworkValue::Share {
                protocol,
                round,
                share,
            } => {
                self.deliver_share(sender, protocol, round, share);
                None
            }
            NetworkValue::Aggregate {
                protocol,
                kind,
                result,
            } => {
                if &sender != self.session.helper_id() {
                    tracing::warn!("Ignoring aggregate of {protocol} from {sender}");
                    return None;
                }
                let result = self.deliver_aggregate(protocol, &kind, result);
                Some((kind, result))
            }
            other => {
                tracing::warn!(
                    "Protocol executor cannot handle {} from {sender}",
                    other.type_name()
                );
                None
            }
        }
    }

    fn finish_decryption(&self, id: &ProtocolId, switched: &S::Ciphertext) -> ProtocolResult<S> {
        let participants = self
            .receiving
            .get(id)
            .map(|participants| participants.clone())
            .ok_or_else(|| ProtocolError::Crypto(format!("no pending decryption for {id}")))?;
        let secret = self.session.additive_secret(&participants).map_err(crypto)?;
        self.session
            .scheme()
            .finish_decryption(switched, &secret)
            .map(AggregatedResult::Plaintext)
            .map_err(crypto)
    }

    fn finish(&self, id: ProtocolId, result: ProtocolResult<S>) {
        let failed = result.is_err();
        match &result {
            Ok(_) => tracing::trace!("{id} is now Completed"),
            Err(e) => self.set_status(id, ProtocolStatus::Failed(e.clone())),
        }
        if let Err(e) = self.results.update(&id, result) {
            tracing::debug!("Result of {id} was already set: {e}");
        }
        if failed {
            self.results.delete(&id);
        } else {
            self.status.remove(&id);
        }
    }

    fn check_participants(&self, descriptor: &ProtocolDescriptor) -> Result<(), ProtocolError> {
        if let Some(node) = descriptor
            .participants
            .iter()
            .find(|node| !self.session.is_session_node(node))
        {
            return Err(ProtocolError::NotAParticipant(node.clone()));
        }
        if descriptor.participants.len() < self.session.threshold() {
            return Err(ProtocolError::InsufficientParticipants {
                available: descriptor.participants.len(),
                needed: self.session.threshold(),
            });
        }
        Ok(())
    }

    fn share_input<'a>(
        &'a self,
        kind: &ProtocolKind,
        input: &'a ProtocolInput<S>,
    ) -> Result<ShareInput<'a, S>, ProtocolError> {
        let seed = self.session.public_seed();
        match (kind, input) {
            (ProtocolKind::CollectivePublicKeyGen, _) => Ok(ShareInput::PublicKey { seed }),
            (ProtocolKind::RelinKeyGen, ProtocolInput::RelinKey { public_key }) => {
                Ok(ShareInput::RelinKey { seed, public_key })
            }
            (ProtocolKind::RotationKeyGen(element), _) => Ok(ShareInput::GaloisKey {
                seed,
                element: *element,
            }),
            (
                ProtocolKind::CollectiveDecrypt { receiver, .. },
                ProtocolInput::Decrypt {
                    ciphertext,
                    smudging,
                },
            ) => Ok(ShareInput::Decrypt {
                ciphertext,
                smudging: *smudging,
                receiver_local: self.session.is_session_node(receiver),
            }),
            _ => Err(ProtocolError::Crypto(format!(
                "protocol input does not match kind {kind}"
            ))),
        }
    }

    fn set_status(&self, id: ProtocolId, status: ProtocolStatus) {
        tracing::trace!("{id} is now {status:?}");
        self.status.insert(id, status);
    }

    async fn acquire<'a>(&self, semaphore: &'a Semaphore) -> Result<SemaphorePermit<'a>, ProtocolError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled),
            permit = semaphore.acquire() => permit.map_err(|_| ProtocolError::Cancelled),
        }
    }

    async fn await_cell(&self, cell: ResultCell<AggregatedResult<S>, ProtocolError>) -> ProtocolResult<S> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled),
            result = cell.get() => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use aes_prng::AesRng;
    use rand::SeedableRng;

    use super::*;
    use crate::execution::runtime::party::generate_node_ids;
    use crate::execution::runtime::session::{gen_test_secret_keys, SessionParameters};
    use crate::networking::local::LocalNetworkingProducer;
    use crate::networking::sending::RetryConfig;
    use crate::networking::{Networking, NetworkingImpl};
    use crate::scheme::reference::{
        ReferenceParameters, ReferenceScheme, ReferenceShare, SecretShare,
    };

    struct Cluster {
        producer: LocalNetworkingProducer,
        helper: Arc<ProtocolExecutor<ReferenceScheme>>,
        parties: BTreeMap<NodeId, Arc<ProtocolExecutor<ReferenceScheme>>>,
        cancel: CancellationToken,
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            round_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
            max_elapsed_time: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    fn spawn_pump(executor: Arc<ProtocolExecutor<ReferenceScheme>>, net: NetworkingImpl) {
        tokio::spawn(async move {
            while let Ok((sender, bytes)) = net.receive().await {
                match NetworkValue::from_network(&bytes) {
                    Ok(value) => {
                        executor.handle_message(sender, value);
                    }
                    Err(e) => tracing::warn!("{e}"),
                }
            }
        });
    }

    fn cluster(n: usize, t: usize, config: ExecutorConfig) -> Cluster {
        let nodes = generate_node_ids(n);
        let helper_id = NodeId::from("cloud");
        let parameters = SessionParameters {
            name: "executor-test".to_string(),
            public_points: nodes
                .iter()
                .enumerate()
                .map(|(i, node)| (node.clone(), i as u64 + 1))
                .collect(),
            nodes: nodes.clone(),
            threshold: t,
            public_seed: b"executor".to_vec(),
            scheme: ReferenceParameters::default(),
        };
        let mut rng = AesRng::seed_from_u64(7);
        let mut secrets = gen_test_secret_keys::<ReferenceScheme, _>(&parameters, &mut rng).unwrap();
        let producer = LocalNetworkingProducer::from_nodes(nodes.iter().chain([&helper_id]));
        let cancel = CancellationToken::new();

        let make = |own: &NodeId,
                    secret: Option<SecretShare>|
         -> Arc<ProtocolExecutor<ReferenceScheme>> {
            let session = Session::new(parameters.clone(), own.clone(), helper_id.clone(), secret).unwrap();
            let net: NetworkingImpl = Arc::new(producer.user_net(own.clone()));
            let executor = Arc::new(ProtocolExecutor::new(
                Arc::new(session),
                config.clone(),
                Outbox::new(Arc::clone(&net), retry()),
                cancel.child_token(),
            ));
            spawn_pump(Arc::clone(&executor), net);
            executor
        };
        let helper = make(&helper_id, None);
        let parties = nodes
            .iter()
            .map(|node| (node.clone(), make(node, secrets.remove(node))))
            .collect();
        Cluster {
            producer,
            helper,
            parties,
            cancel,
        }
    }

    #[tokio::test]
    async fn collective_public_key_reaches_every_node() {
        let cluster = cluster(4, 3, config());
        let descriptor = cluster
            .helper
            .descriptor(ProtocolKind::CollectivePublicKeyGen)
            .unwrap();
        assert_eq!(descriptor.participants.len(), 3);
        let id = cluster.helper.protocol_id(&descriptor.kind).unwrap();

        let result = cluster
            .helper
            .run(descriptor.clone(), ProtocolRole::Aggregator, ProtocolInput::None)
            .await
            .unwrap();
        let AggregatedResult::PublicKey(public_key) = result else {
            panic!("unexpected result {}", result.kind_name());
        };
        assert_eq!(cluster.helper.status(&id), Some(ProtocolStatus::Completed));

        for party in cluster.parties.values() {
            match party.await_result(&id).await.unwrap() {
                AggregatedResult::PublicKey(received) => assert_eq!(received, public_key),
                other => panic!("unexpected result {}", other.kind_name()),
            }
        }

        // second run is served from the cache
        let again = cluster
            .helper
            .run(descriptor, ProtocolRole::Aggregator, ProtocolInput::None)
            .await
            .unwrap();
        assert!(matches!(again, AggregatedResult::PublicKey(pk) if pk == public_key));
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn too_few_reachable_nodes() {
        let cluster = cluster(3, 2, config());
        cluster.producer.disconnect(&NodeId::from("node-0"));
        cluster.producer.disconnect(&NodeId::from("node-1"));
        assert_eq!(
            cluster
                .helper
                .descriptor(ProtocolKind::CollectivePublicKeyGen)
                .unwrap_err(),
            ProtocolError::InsufficientParticipants {
                available: 1,
                needed: 2
            }
        );
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn decryption_receiver_is_always_selected() {
        let cluster = cluster(4, 2, config());
        let kind = ProtocolKind::CollectiveDecrypt {
            operand: crate::execution::circuits::OperandLabel::from("//node-3/x"),
            receiver: NodeId::from("node-3"),
        };
        let participants = cluster
            .helper
            .select_participants(&kind, &BTreeSet::new())
            .unwrap();
        assert_eq!(
            participants,
            BTreeSet::from([NodeId::from("node-0"), NodeId::from("node-3")])
        );
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn muted_participant_times_out_the_round() {
        let cluster = cluster(3, 3, config());
        cluster.producer.mute(&NodeId::from("node-2"));
        let descriptor = cluster
            .helper
            .descriptor(ProtocolKind::CollectivePublicKeyGen)
            .unwrap();
        let id = cluster.helper.protocol_id(&descriptor.kind).unwrap();
        let err = cluster
            .helper
            .run(descriptor, ProtocolRole::Aggregator, ProtocolInput::None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Timeout {
                received: 2,
                needed: 3
            }
        );
        assert!(matches!(cluster.helper.status(&id), Some(ProtocolStatus::Failed(_))));
        // failures are not cached
        assert!(cluster.helper.completed(&id).is_none());
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn retry_excludes_silent_nodes() {
        let cluster = cluster(
            4,
            3,
            ExecutorConfig {
                max_attempts: 2,
                ..config()
            },
        );
        cluster.producer.mute(&NodeId::from("node-0"));
        let descriptor = cluster
            .helper
            .descriptor(ProtocolKind::CollectivePublicKeyGen)
            .unwrap();
        assert!(descriptor.participants.contains(&NodeId::from("node-0")));
        let result = cluster
            .helper
            .run(descriptor, ProtocolRole::Aggregator, ProtocolInput::None)
            .await
            .unwrap();
        assert!(matches!(result, AggregatedResult::PublicKey(_)));
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let cluster = cluster(2, 2, config());
        let party = cluster.parties.values().next().unwrap().clone();
        let id = party
            .protocol_id(&ProtocolKind::RelinKeyGen)
            .unwrap();
        let waiter = tokio::spawn(async move { party.await_result(&id).await });
        cluster.cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap_err(), ProtocolError::Cancelled);
    }

    fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|name| NodeId::from(*name)).collect()
    }

    fn aggregated_by_helper(kind: ProtocolKind, participants: &[&str]) -> ProtocolDescriptor {
        ProtocolDescriptor {
            kind,
            aggregator: NodeId::from("cloud"),
            participants: nodes(participants),
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn spawn_aggregation(
        helper: &Arc<ProtocolExecutor<ReferenceScheme>>,
        descriptor: ProtocolDescriptor,
    ) -> tokio::task::JoinHandle<ProtocolResult<ReferenceScheme>> {
        let helper = Arc::clone(helper);
        tokio::spawn(async move {
            helper
                .run(descriptor, ProtocolRole::Aggregator, ProtocolInput::None)
                .await
        })
    }

    #[tokio::test]
    async fn reissued_descriptor_resumes_after_failure() {
        let cluster = cluster(3, 3, config());
        let muted = NodeId::from("node-2");
        cluster.producer.mute(&muted);
        let descriptor = cluster
            .helper
            .descriptor(ProtocolKind::CollectivePublicKeyGen)
            .unwrap();
        let id = cluster.helper.protocol_id(&descriptor.kind).unwrap();
        let first = cluster
            .helper
            .run(descriptor.clone(), ProtocolRole::Aggregator, ProtocolInput::None)
            .await;
        assert_eq!(
            first.unwrap_err(),
            ProtocolError::Timeout {
                received: 2,
                needed: 3
            }
        );

        cluster.producer.reconnect(&muted);
        let second = cluster
            .helper
            .run(descriptor, ProtocolRole::Aggregator, ProtocolInput::None)
            .await
            .unwrap();
        assert!(matches!(second, AggregatedResult::PublicKey(_)));
        assert_eq!(cluster.helper.status(&id), Some(ProtocolStatus::Completed));

        for party in cluster.parties.values() {
            assert!(party.await_result(&id).await.is_ok());
            assert!(!party.contributed.iter().any(|entry| entry.0 == id));
            assert_eq!(party.status(&id), Some(ProtocolStatus::Completed));
            assert!(!party.status.contains_key(&id));
        }
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn invalid_share_is_discarded_and_the_round_completes() {
        let cluster = cluster(
            3,
            3,
            ExecutorConfig {
                round_timeout: Duration::from_secs(3),
                ..config()
            },
        );
        let late = NodeId::from("node-2");
        cluster.producer.mute(&late);
        let descriptor = aggregated_by_helper(
            ProtocolKind::CollectivePublicKeyGen,
            &["node-0", "node-1", "node-2"],
        );
        let id = cluster.helper.protocol_id(&descriptor.kind).unwrap();
        let run = spawn_aggregation(&cluster.helper, descriptor.clone());

        eventually(|| cluster.helper.open_round(&id).is_some()).await;
        let round = cluster.helper.open_round(&id).unwrap();
        // wrong number of slots
        cluster
            .helper
            .deliver_share(late.clone(), id, round, ReferenceShare::Single(vec![]));
        assert!(!run.is_finished());

        let session = cluster.parties[&late].session();
        let secret = session.additive_secret(&descriptor.participants).unwrap();
        let share = session
            .scheme()
            .gen_share(
                &ShareInput::PublicKey {
                    seed: session.public_seed(),
                },
                &secret,
                &mut AesRng::seed_from_u64(11),
            )
            .unwrap();
        cluster.helper.deliver_share(late, id, round, share);

        let result = run.await.unwrap().unwrap();
        assert!(matches!(result, AggregatedResult::PublicKey(_)));
        assert_eq!(cluster.helper.status(&id), Some(ProtocolStatus::Completed));
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn shares_of_another_round_are_ignored() {
        let cluster = cluster(
            3,
            3,
            ExecutorConfig {
                round_timeout: Duration::from_millis(300),
                ..config()
            },
        );
        let late = NodeId::from("node-2");
        cluster.producer.mute(&late);
        let descriptor = aggregated_by_helper(
            ProtocolKind::CollectivePublicKeyGen,
            &["node-0", "node-1", "node-2"],
        );
        let id = cluster.helper.protocol_id(&descriptor.kind).unwrap();
        let run = spawn_aggregation(&cluster.helper, descriptor.clone());

        eventually(|| cluster.helper.open_round(&id).is_some()).await;
        let round = cluster.helper.open_round(&id).unwrap();
        let session = cluster.parties[&late].session();
        let secret = session.additive_secret(&descriptor.participants).unwrap();
        let share = session
            .scheme()
            .gen_share(
                &ShareInput::PublicKey {
                    seed: session.public_seed(),
                },
                &secret,
                &mut AesRng::seed_from_u64(11),
            )
            .unwrap();
        cluster
            .helper
            .deliver_share(late, id, round.wrapping_add(1), share);

        assert_eq!(
            run.await.unwrap().unwrap_err(),
            ProtocolError::Timeout {
                received: 2,
                needed: 3
            }
        );
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn failing_instance_leaves_a_concurrent_one_intact() {
        let cluster = cluster(4, 3, config());
        cluster.producer.mute(&NodeId::from("node-3"));
        let element = cluster.helper.session().scheme().galois_element(1);
        let healthy = aggregated_by_helper(
            ProtocolKind::CollectivePublicKeyGen,
            &["node-0", "node-1", "node-2"],
        );
        let starved = aggregated_by_helper(
            ProtocolKind::RotationKeyGen(element),
            &["node-1", "node-2", "node-3"],
        );
        let healthy_id = cluster.helper.protocol_id(&healthy.kind).unwrap();
        let starved_id = cluster.helper.protocol_id(&starved.kind).unwrap();

        let (completed, failed) = tokio::join!(
            cluster
                .helper
                .run(healthy, ProtocolRole::Aggregator, ProtocolInput::None),
            cluster
                .helper
                .run(starved, ProtocolRole::Aggregator, ProtocolInput::None),
        );
        assert!(matches!(completed, Ok(AggregatedResult::PublicKey(_))));
        assert_eq!(
            failed.unwrap_err(),
            ProtocolError::Timeout {
                received: 2,
                needed: 3
            }
        );
        assert_eq!(
            cluster.helper.status(&healthy_id),
            Some(ProtocolStatus::Completed)
        );
        assert!(matches!(
            cluster.helper.status(&starved_id),
            Some(ProtocolStatus::Failed(_))
        ));
        let party = &cluster.parties[&NodeId::from("node-1")];
        assert!(party.await_result(&healthy_id).await.is_ok());
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn aggregations_beyond_the_bound_wait_their_turn() {
        let cluster = cluster(
            4,
            3,
            ExecutorConfig {
                max_aggregation: 1,
                max_participation: 1,
                ..config()
            },
        );
        cluster.producer.mute(&NodeId::from("node-3"));
        let element = cluster.helper.session().scheme().galois_element(1);
        let slow = aggregated_by_helper(
            ProtocolKind::RotationKeyGen(element),
            &["node-1", "node-2", "node-3"],
        );
        let queued = aggregated_by_helper(
            ProtocolKind::CollectivePublicKeyGen,
            &["node-0", "node-1", "node-2"],
        );
        let slow_id = cluster.helper.protocol_id(&slow.kind).unwrap();
        let queued_id = cluster.helper.protocol_id(&queued.kind).unwrap();

        let slow_run = spawn_aggregation(&cluster.helper, slow);
        eventually(|| cluster.helper.open_round(&slow_id).is_some()).await;
        let queued_run = spawn_aggregation(&cluster.helper, queued);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.helper.status(&queued_id), None);
        assert!(cluster.helper.open_round(&queued_id).is_none());

        assert!(matches!(
            slow_run.await.unwrap(),
            Err(ProtocolError::Timeout { .. })
        ));
        assert!(matches!(
            queued_run.await.unwrap(),
            Ok(AggregatedResult::PublicKey(_))
        ));
        cluster.cancel.cancel();
    }

    #[tokio::test]
    async fn participant_stays_active_until_the_outcome_arrives() {
        let cluster = cluster(3, 3, config());
        cluster.producer.mute(&NodeId::from("node-2"));
        let bound = config().max_proto_per_node;
        let party = Arc::clone(&cluster.parties[&NodeId::from("node-0")]);
        let descriptor = cluster
            .helper
            .descriptor(ProtocolKind::CollectivePublicKeyGen)
            .unwrap();
        let run = spawn_aggregation(&cluster.helper, descriptor);

        eventually(|| party.active.available_permits() == bound - 1).await;
        assert!(matches!(
            run.await.unwrap(),
            Err(ProtocolError::Timeout { .. })
        ));
        eventually(|| party.active.available_permits() == bound).await;
        cluster.cancel.cancel();
    }

    #[test]
    fn default_bounds() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_attempts, 1);
        assert!(config.max_aggregation <= config.max_proto_per_node);
    }
}
