//! Distributed sub-protocols of a session: collective key generation and collective decryption.
//!
//! Every instance is described by a [ProtocolDescriptor]. An aggregator announces the instance
//! to its participants, collects one share from each and publishes the combined result.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::execution::circuits::OperandLabel;
use crate::execution::runtime::party::NodeId;
use crate::hashing::{serialize_hash_element, DomainSep};
use crate::scheme::{GaloisElement, MheScheme};
use crate::session_id::SessionId;

pub mod executor;
pub mod result_store;

const DSEP_PROTOCOL_ID: DomainSep = *b"PROTO_ID";
pub const PROTOCOL_ID_BYTES: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolKind {
    CollectivePublicKeyGen,
    RelinKeyGen,
    RotationKeyGen(GaloisElement),
    CollectiveDecrypt {
        operand: OperandLabel,
        receiver: NodeId,
    },
}

impl ProtocolKind {
    /// Key-generation kinds, as opposed to decryption.
    pub fn is_setup(&self) -> bool {
        !matches!(self, ProtocolKind::CollectiveDecrypt { .. })
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::CollectivePublicKeyGen => write!(f, "CKG"),
            ProtocolKind::RelinKeyGen => write!(f, "RKG"),
            ProtocolKind::RotationKeyGen(element) => write!(f, "RTG[{element}]"),
            ProtocolKind::CollectiveDecrypt { operand, receiver } => {
                write!(f, "DEC[{operand} -> {receiver}]")
            }
        }
    }
}

/// Identity of a protocol instance, derived from the session and the kind only.
///
/// Re-issuing a kind, possibly with other participants, addresses the same instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolId(pub [u8; PROTOCOL_ID_BYTES]);

impl ProtocolId {
    pub fn derive(session: SessionId, kind: &ProtocolKind) -> anyhow::Result<Self> {
        let digest = serialize_hash_element(
            &DSEP_PROTOCOL_ID,
            &(session.to_le_bytes(), kind),
            PROTOCOL_ID_BYTES,
        )?;
        let mut id = [0u8; PROTOCOL_ID_BYTES];
        id.copy_from_slice(&digest);
        Ok(ProtocolId(id))
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub kind: ProtocolKind,
    pub aggregator: NodeId,
    pub participants: BTreeSet<NodeId>,
}

impl ProtocolDescriptor {
    pub fn id(&self, session: SessionId) -> anyhow::Result<ProtocolId> {
        ProtocolId::derive(session, &self.kind)
    }

    /// The receiver of a decryption, if it is expected to finish the decryption itself.
    pub fn local_receiver(&self) -> Option<&NodeId> {
        match &self.kind {
            ProtocolKind::CollectiveDecrypt { receiver, .. }
                if self.participants.contains(receiver) =>
            {
                Some(receiver)
            }
            _ => None,
        }
    }

    /// Participants that send a share to the aggregator.
    pub fn contributors(&self) -> BTreeSet<NodeId> {
        let receiver = self.local_receiver();
        self.participants
            .iter()
            .filter(|node| Some(*node) != receiver)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolRole {
    Participant,
    Aggregator,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolStatus {
    Pending,
    AwaitingShares,
    Aggregating,
    Completed,
    Failed(ProtocolError),
}

impl ProtocolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolStatus::Completed | ProtocolStatus::Failed(_))
    }
}

/// Public per-instance input that the aggregator forwards to the participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ProtocolInput<S: MheScheme> {
    None,
    RelinKey { public_key: S::PublicKey },
    Decrypt { ciphertext: S::Ciphertext, smudging: f64 },
}
