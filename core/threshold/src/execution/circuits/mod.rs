//! Circuits: declared computations over labelled operands.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::error_handler::anyhow_error_and_warn_log;
use crate::error::CircuitError;
use crate::execution::runtime::party::NodeId;
use crate::scheme::MheScheme;

pub mod matmul;
pub mod operand_store;
pub mod runtime;

use runtime::CircuitRuntime;

/// Hierarchical operand label of the form `//owner/name`.
///
/// The first segment names the node owning the operand, or a role of the circuit that maps to it.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct OperandLabel(String);

impl OperandLabel {
    pub fn new(label: impl Into<String>) -> Self {
        OperandLabel(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> Vec<&str> {
        self.0
            .trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Self {
        OperandLabel(format!("//{}", segments.into_iter().join("/")))
    }

    /// First path segment.
    pub fn owner(&self) -> Option<&str> {
        self.0
            .trim_start_matches('/')
            .split('/')
            .find(|segment| !segment.is_empty())
    }

    pub fn owner_node(&self) -> Option<NodeId> {
        self.owner().map(NodeId::from)
    }

    /// Replaces a role in the owner position by the node it maps to.
    pub fn resolve(&self, mapping: &BTreeMap<String, NodeId>) -> Self {
        let mut segments = self.segments();
        match segments.first().and_then(|owner| mapping.get(*owner)) {
            Some(node) => {
                segments[0] = node.as_str();
                OperandLabel::from_segments(segments)
            }
            None => self.clone(),
        }
    }

    /// `//owner/name` becomes `//owner/<circuit>/name`.
    pub fn scoped(&self, circuit: &CircuitId) -> Self {
        let segments = self.segments();
        match segments.split_first() {
            Some((owner, rest)) => OperandLabel::from_segments(
                std::iter::once(*owner)
                    .chain(std::iter::once(circuit.as_str()))
                    .chain(rest.iter().copied()),
            ),
            None => OperandLabel::from_segments([circuit.as_str()]),
        }
    }
}

impl From<&str> for OperandLabel {
    fn from(label: &str) -> Self {
        OperandLabel::new(label)
    }
}

impl From<String> for OperandLabel {
    fn from(label: String) -> Self {
        OperandLabel(label)
    }
}

/// Identifier of one circuit evaluation, unique within a session.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct CircuitId(String);

impl CircuitId {
    pub fn new(id: impl Into<String>) -> Self {
        CircuitId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CircuitId {
    fn from(id: &str) -> Self {
        CircuitId::new(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitDescriptor {
    /// Name under which the circuit is registered.
    pub name: String,
    pub id: CircuitId,
    /// Logical role to node.
    pub node_mapping: BTreeMap<String, NodeId>,
    pub evaluator: NodeId,
}

/// A circuit program, evaluated by the designated evaluator through a [CircuitRuntime].
#[async_trait]
pub trait Circuit<S: MheScheme>: Send + Sync {
    async fn evaluate(&self, rt: &mut CircuitRuntime<S>) -> Result<(), CircuitError>;
}

pub struct CircuitRegistry<S: MheScheme> {
    circuits: HashMap<String, Arc<dyn Circuit<S>>>,
}

impl<S: MheScheme> Default for CircuitRegistry<S> {
    fn default() -> Self {
        CircuitRegistry {
            circuits: HashMap::new(),
        }
    }
}

impl<S: MheScheme> CircuitRegistry<S> {
    pub fn register(&mut self, name: impl Into<String>, circuit: Arc<dyn Circuit<S>>) -> &mut Self {
        self.circuits.insert(name.into(), circuit);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Circuit<S>>> {
        self.circuits.get(name).cloned()
    }
}

/// A decrypted result, delivered to its receiver only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub label: OperandLabel,
    pub receiver: NodeId,
    pub values: Vec<u64>,
}

/// Source of the plaintext inputs a node owns, implemented by the application.
#[async_trait]
pub trait InputProvider: Send + Sync {
    /// `None` declines the request.
    async fn provide(
        &self,
        circuit: &CircuitId,
        label: &OperandLabel,
    ) -> anyhow::Result<Option<Vec<u64>>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecOptions {
    /// Standard deviation of the smudging noise added to every partial decryption.
    pub smudging: f64,
}

impl Default for DecOptions {
    fn default() -> Self {
        DecOptions { smudging: 3.2 }
    }
}

impl DecOptions {
    /// Reads the options from string literals such as `{"smudging": "40.0"}`.
    pub fn from_map(options: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut parsed = DecOptions::default();
        for (key, value) in options {
            match key.as_str() {
                "smudging" => {
                    parsed.smudging = value.parse().map_err(|e| {
                        anyhow_error_and_warn_log(format!("Invalid smudging value {value}: {e}"))
                    })?
                }
                other => {
                    return Err(anyhow_error_and_warn_log(format!(
                        "Unknown decryption option {other}"
                    )))
                }
            }
        }
        Ok(parsed)
    }
}

impl fmt::Display for CircuitDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.name, self.id, self.evaluator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_segments() {
        let label = OperandLabel::from("//node-0/vec");
        assert_eq!(label.owner(), Some("node-0"));
        assert_eq!(
            label.scoped(&CircuitId::from("matmul-0")),
            OperandLabel::from("//node-0/matmul-0/vec")
        );
        assert_eq!(OperandLabel::from("//").owner(), None);
    }

    #[test]
    fn roles_are_resolved() {
        let mapping = BTreeMap::from([("in".to_string(), NodeId::from("node-1"))]);
        assert_eq!(
            OperandLabel::from("//in/vec").resolve(&mapping),
            OperandLabel::from("//node-1/vec")
        );
        assert_eq!(
            OperandLabel::from("//node-2/vec").resolve(&mapping),
            OperandLabel::from("//node-2/vec")
        );
    }

    #[test]
    fn dec_options() {
        let options = BTreeMap::from([("smudging".to_string(), "40.0".to_string())]);
        assert_eq!(DecOptions::from_map(&options).unwrap().smudging, 40.0);
        let bad = BTreeMap::from([("smudging".to_string(), "lots".to_string())]);
        assert!(DecOptions::from_map(&bad).is_err());
        let unknown = BTreeMap::from([("noise".to_string(), "1".to_string())]);
        assert!(DecOptions::from_map(&unknown).is_err());
    }
}
