//! Collective key material of a session.
//!
//! The aggregator drives key generation through the setup [ProtocolExecutor]. Every other
//! node observes the published aggregates, so all nodes end up with the same cached keys.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::error::{CircuitError, ProtocolError};
use crate::execution::protocols::executor::{ProtocolExecutor, ProtocolResult};
use crate::execution::protocols::{ProtocolInput, ProtocolKind, ProtocolRole};
use crate::scheme::{AggregatedResult, GaloisElement, MheScheme};

/// Keys to generate during setup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupDescription {
    pub cpk: bool,
    pub rlk: bool,
    /// Rotations, in slot steps, for which a Galois key is needed.
    pub rotations: Vec<usize>,
}

impl SetupDescription {
    /// The Galois elements of the declared rotations, without the identity.
    pub fn galois_elements<S: MheScheme>(&self, scheme: &S) -> BTreeSet<GaloisElement> {
        self.rotations
            .iter()
            .map(|steps| scheme.galois_element(*steps))
            .filter(|element| element.0 != 0)
            .collect()
    }
}

fn unexpected<S: MheScheme>(kind: &ProtocolKind, result: &AggregatedResult<S>) -> ProtocolError {
    ProtocolError::Crypto(format!(
        "protocol {kind} produced a {} result",
        result.kind_name()
    ))
}

pub struct KeyMaterialManager<S: MheScheme> {
    executor: Arc<ProtocolExecutor<S>>,
}

impl<S: MheScheme> KeyMaterialManager<S> {
    pub fn new(executor: Arc<ProtocolExecutor<S>>) -> Self {
        KeyMaterialManager { executor }
    }

    pub fn executor(&self) -> &Arc<ProtocolExecutor<S>> {
        &self.executor
    }

    /// Runs the instance on the aggregator, waits for its aggregate everywhere else.
    async fn obtain(&self, kind: ProtocolKind, input: ProtocolInput<S>) -> ProtocolResult<S> {
        if self.executor.session().is_helper() {
            let descriptor = self.executor.descriptor(kind)?;
            self.executor
                .run(descriptor, ProtocolRole::Aggregator, input)
                .await
        } else {
            let id = self.executor.protocol_id(&kind)?;
            self.executor.await_result(&id).await
        }
    }

    fn completed(&self, kind: &ProtocolKind) -> Option<AggregatedResult<S>> {
        let id = self.executor.protocol_id(kind).ok()?;
        self.executor.completed(&id)?.ok()
    }

    pub async fn collective_public_key(&self) -> Result<S::PublicKey, ProtocolError> {
        let kind = ProtocolKind::CollectivePublicKeyGen;
        match self.obtain(kind.clone(), ProtocolInput::None).await? {
            AggregatedResult::PublicKey(public_key) => Ok(public_key),
            other => Err(unexpected(&kind, &other)),
        }
    }

    /// The relinearization key. Generating it needs the collective public key first.
    pub async fn relin_key(&self) -> Result<S::RelinKey, ProtocolError> {
        let kind = ProtocolKind::RelinKeyGen;
        let input = if self.executor.session().is_helper() {
            ProtocolInput::RelinKey {
                public_key: self.collective_public_key().await?,
            }
        } else {
            ProtocolInput::None
        };
        match self.obtain(kind.clone(), input).await? {
            AggregatedResult::RelinKey(relin_key) => Ok(relin_key),
            other => Err(unexpected(&kind, &other)),
        }
    }

    pub async fn galois_key(&self, element: GaloisElement) -> Result<S::GaloisKey, ProtocolError> {
        let kind = ProtocolKind::RotationKeyGen(element);
        match self.obtain(kind.clone(), ProtocolInput::None).await? {
            AggregatedResult::GaloisKey(galois_key) => Ok(galois_key),
            other => Err(unexpected(&kind, &other)),
        }
    }

    pub fn completed_public_key(&self) -> Option<S::PublicKey> {
        match self.completed(&ProtocolKind::CollectivePublicKeyGen)? {
            AggregatedResult::PublicKey(public_key) => Some(public_key),
            _ => None,
        }
    }

    pub fn completed_relin_key(&self) -> Option<S::RelinKey> {
        match self.completed(&ProtocolKind::RelinKeyGen)? {
            AggregatedResult::RelinKey(relin_key) => Some(relin_key),
            _ => None,
        }
    }

    pub fn completed_galois_key(&self, element: GaloisElement) -> Option<S::GaloisKey> {
        match self.completed(&ProtocolKind::RotationKeyGen(element))? {
            AggregatedResult::GaloisKey(galois_key) => Some(galois_key),
            _ => None,
        }
    }

    /// Generates every declared key, as aggregator.
    ///
    /// The public key comes first. The relinearization key and the rotation keys are then
    /// generated concurrently, within the bounds of the setup executor.
    pub async fn run_setup(self: &Arc<Self>, description: &SetupDescription) -> Result<(), ProtocolError> {
        tracing::info!(
            "Running setup: cpk={}, rlk={}, rotations=[{}]",
            description.cpk,
            description.rlk,
            description.rotations.iter().join(", ")
        );
        if description.cpk || description.rlk {
            self.collective_public_key().await?;
        }

        let mut tasks = JoinSet::new();
        if description.rlk {
            let manager = Arc::clone(self);
            tasks.spawn(async move { manager.relin_key().await.map(|_| ()) });
        }
        for element in description.galois_elements(self.executor.session().scheme()) {
            let manager = Arc::clone(self);
            tasks.spawn(async move { manager.galois_key(element).await.map(|_| ()) });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(ProtocolError::Crypto(format!("setup task panicked: {e}")))
            });
            if let Err(e) = outcome {
                tracing::error!("Setup failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Setup completed");
                Ok(())
            }
        }
    }

    /// Blocks until every declared key is cached on this node.
    pub async fn await_setup(&self, description: &SetupDescription) -> Result<(), ProtocolError> {
        if description.cpk || description.rlk {
            self.collective_public_key().await?;
        }
        if description.rlk {
            self.relin_key().await?;
        }
        for element in description.galois_elements(self.executor.session().scheme()) {
            self.galois_key(element).await?;
        }
        Ok(())
    }

    /// Evaluator over the cached keys, with exactly the requested rotations.
    pub fn evaluator(&self, needs_relin: bool, rotations: &[usize]) -> Result<S::Evaluator, CircuitError> {
        let scheme = self.executor.session().scheme();
        let relin_key = match needs_relin {
            true => Some(self.completed_relin_key().ok_or_else(|| {
                CircuitError::MissingKeyMaterial("relinearization key".to_string())
            })?),
            false => None,
        };
        let mut galois_keys = BTreeMap::new();
        for steps in rotations {
            let element = scheme.galois_element(*steps);
            if element.0 == 0 {
                continue;
            }
            let key = self.completed_galois_key(element).ok_or_else(|| {
                CircuitError::MissingKeyMaterial(format!("rotation key for {steps} steps"))
            })?;
            galois_keys.insert(element, key);
        }
        Ok(scheme.evaluator(relin_key, galois_keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::reference::{ReferenceParameters, ReferenceScheme};

    #[test]
    fn identity_rotations_need_no_key() {
        let scheme = ReferenceScheme::new(ReferenceParameters::default()).unwrap();
        let description = SetupDescription {
            cpk: true,
            rlk: true,
            rotations: vec![0, 1, 17, 16, 3],
        };
        assert_eq!(
            description.galois_elements(&scheme),
            BTreeSet::from([GaloisElement(1), GaloisElement(3)])
        );
    }
}
