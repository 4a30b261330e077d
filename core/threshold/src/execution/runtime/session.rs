use std::collections::{BTreeMap, BTreeSet};

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

use super::party::NodeId;
use crate::{
    algebra::zq::{Zq, MODULUS},
    error::{error_handler::anyhow_error_and_log, ConfigError},
    scheme::MheScheme,
    session_id::SessionId,
};

/// Construction input of a [Session], supplied once at node startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionParameters<P> {
    pub name: String,
    /// Session nodes, in the order used for participant selection.
    pub nodes: Vec<NodeId>,
    pub threshold: usize,
    pub public_seed: Vec<u8>,
    pub scheme: P,
    pub public_points: BTreeMap<NodeId, u64>,
}

/// Immutable parameter context of one computation, as seen by one node.
#[derive(Debug)]
pub struct Session<S: MheScheme> {
    id: SessionId,
    name: String,
    nodes: Vec<NodeId>,
    threshold: usize,
    public_seed: Vec<u8>,
    points: BTreeMap<NodeId, Zq>,
    own: NodeId,
    helper: NodeId,
    secret: Option<S::SecretShare>,
    scheme: S,
}

impl<S: MheScheme> Session<S> {
    /// Validates the parameters and the local secret share.
    ///
    /// Session nodes must hold a secret share consistent with their public point, the helper
    /// holds none.
    pub fn new(
        parameters: SessionParameters<S::Parameters>,
        own: NodeId,
        helper: NodeId,
        secret: Option<S::SecretShare>,
    ) -> Result<Self, ConfigError> {
        let SessionParameters {
            name,
            nodes,
            threshold,
            public_seed,
            scheme,
            public_points,
        } = parameters;

        let n = nodes.len();
        if threshold == 0 || threshold > n {
            return Err(ConfigError::InvalidThreshold {
                threshold,
                nodes: n,
            });
        }
        let mut unique = BTreeSet::new();
        for node in &nodes {
            if !unique.insert(node) {
                return Err(ConfigError::DuplicateNode(node.clone()));
            }
        }
        if unique.contains(&helper) {
            return Err(ConfigError::InconsistentNodeList(format!(
                "helper {helper} must not be a session node"
            )));
        }
        if own != helper && !unique.contains(&own) {
            return Err(ConfigError::MissingNodeIdentity(format!(
                "{own} is neither a session node nor the helper"
            )));
        }
        if let Some(unknown) = public_points.keys().find(|node| !unique.contains(node)) {
            return Err(ConfigError::InconsistentNodeList(format!(
                "public point given for unknown node {unknown}"
            )));
        }

        let mut points = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for node in &nodes {
            let point = *public_points
                .get(node)
                .ok_or_else(|| ConfigError::InvalidPublicPoint {
                    node: node.clone(),
                    reason: "missing".to_string(),
                })?;
            if point == 0 || point >= MODULUS {
                return Err(ConfigError::InvalidPublicPoint {
                    node: node.clone(),
                    reason: format!("{point} is not a non-zero field element"),
                });
            }
            if !seen.insert(point) {
                return Err(ConfigError::InvalidPublicPoint {
                    node: node.clone(),
                    reason: format!("{point} is shared with another node"),
                });
            }
            points.insert(node.clone(), Zq::new(point));
        }

        let scheme = S::new(scheme).map_err(|e| ConfigError::InvalidParameters(e.to_string()))?;

        let secret = match points.get(&own) {
            Some(point) => {
                let share = secret.ok_or_else(|| {
                    ConfigError::InvalidSecretShare(format!("no secret share for session node {own}"))
                })?;
                scheme
                    .validate_secret_share(&share, *point)
                    .map_err(|e| ConfigError::InvalidSecretShare(e.to_string()))?;
                Some(share)
            }
            None => {
                if secret.is_some() {
                    tracing::warn!("Ignoring the secret share given to helper {own}");
                }
                None
            }
        };

        Ok(Session {
            id: SessionId::from_name(&name),
            name,
            nodes,
            threshold,
            public_seed,
            points,
            own,
            helper,
            secret,
            scheme,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn public_seed(&self) -> &[u8] {
        &self.public_seed
    }

    pub fn own_id(&self) -> &NodeId {
        &self.own
    }

    pub fn helper_id(&self) -> &NodeId {
        &self.helper
    }

    pub fn is_helper(&self) -> bool {
        self.own == self.helper
    }

    pub fn is_session_node(&self, node: &NodeId) -> bool {
        self.points.contains_key(node)
    }

    pub fn point(&self, node: &NodeId) -> Option<Zq> {
        self.points.get(node).copied()
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn secret(&self) -> Option<&S::SecretShare> {
        self.secret.as_ref()
    }

    /// Additive share of the collective secret for the given participant set.
    pub fn additive_secret(&self, participants: &BTreeSet<NodeId>) -> anyhow::Result<S::AdditiveSecret> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| anyhow_error_and_log(format!("{} holds no secret share", self.own)))?;
        let own_point = self
            .point(&self.own)
            .ok_or_else(|| anyhow_error_and_log(format!("{} has no public point", self.own)))?;
        let points = participants
            .iter()
            .map(|node| {
                self.point(node)
                    .ok_or_else(|| anyhow_error_and_log(format!("{node} is not a session node")))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.scheme.to_additive(secret, own_point, &points)
    }
}

/// Trusted-dealer generation of the secret shares of all session nodes.
pub fn gen_test_secret_keys<S: MheScheme, R: Rng + CryptoRng>(
    parameters: &SessionParameters<S::Parameters>,
    rng: &mut R,
) -> anyhow::Result<BTreeMap<NodeId, S::SecretShare>> {
    let scheme = S::new(parameters.scheme.clone())?;
    let points = parameters
        .nodes
        .iter()
        .map(|node| {
            parameters
                .public_points
                .get(node)
                .map(|p| Zq::new(*p))
                .ok_or_else(|| anyhow_error_and_log(format!("No public point for {node}")))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let shares = scheme.gen_test_secret_shares(parameters.threshold, &points, rng)?;
    Ok(parameters.nodes.iter().cloned().zip(shares).collect())
}
