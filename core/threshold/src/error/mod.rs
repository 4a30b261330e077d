//! Error taxonomy of the node runtime.
//!
//! Each layer has its own error type. Startup problems are [ConfigError] and are fatal,
//! everything else is scoped to the protocol instance, circuit or connection it happened in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::circuits::{CircuitId, OperandLabel};
use crate::execution::runtime::party::NodeId;

pub mod error_handler;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid threshold {threshold} for a session of {nodes} nodes")]
    InvalidThreshold { threshold: usize, nodes: usize },
    #[error("missing node identity: {0}")]
    MissingNodeIdentity(String),
    #[error("inconsistent node list: {0}")]
    InconsistentNodeList(String),
    #[error("node {0} appears more than once in the session")]
    DuplicateNode(NodeId),
    #[error("invalid public point for node {node}: {reason}")]
    InvalidPublicPoint { node: NodeId, reason: String },
    #[error("invalid secret share: {0}")]
    InvalidSecretShare(String),
    #[error("invalid scheme parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("node {node} is unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },
    #[error("transport channel is closed")]
    Closed,
    #[error("codec failure: {0}")]
    Codec(String),
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("round timed out with {received} of {needed} shares")]
    Timeout { received: usize, needed: usize },
    #[error("insufficient participants: {available} available, {needed} needed")]
    InsufficientParticipants { available: usize, needed: usize },
    #[error("invalid share from {sender}: {reason}")]
    InvalidShare { sender: NodeId, reason: String },
    #[error("node {0} is not a participant of this protocol")]
    NotAParticipant(NodeId),
    #[error("protocol cancelled")]
    Cancelled,
    #[error("cryptographic failure: {0}")]
    Crypto(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CircuitError {
    #[error("missing input {label}: {reason}")]
    MissingInput { label: OperandLabel, reason: String },
    #[error("missing operand {0}")]
    MissingOperand(OperandLabel),
    #[error("circuit must be evaluated by {expected}, not {actual}")]
    EvaluatorMismatch { expected: NodeId, actual: NodeId },
    #[error("internal cryptographic failure: {0}")]
    InternalCryptoFailure(String),
    #[error("missing key material: {0}")]
    MissingKeyMaterial(String),
    #[error("unknown circuit {0}")]
    UnknownCircuit(String),
    #[error("unknown node role {0}")]
    UnknownRole(String),
    #[error("operand {0} is already defined")]
    DuplicateOperand(OperandLabel),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("circuit cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("circuit id {0} was already submitted in this session")]
    DuplicateCircuit(CircuitId),
    #[error("circuit queue is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Circuit(#[from] CircuitError),
    #[error("node was already started")]
    AlreadyStarted,
}
