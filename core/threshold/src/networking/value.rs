use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::error_handler::anyhow_error_and_log;
use crate::error::ProtocolError;
use crate::execution::circuits::{CircuitId, OperandLabel};
use crate::execution::protocols::{ProtocolDescriptor, ProtocolId, ProtocolInput, ProtocolKind};
use crate::scheme::{AggregatedResult, MheScheme};

/// Upper bound on the size of a single deserialized message.
pub const SAFE_SER_SIZE_LIMIT: usize = 1 << 30;

type WireConfig = bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<SAFE_SER_SIZE_LIMIT>,
>;

fn wire_config() -> WireConfig {
    bincode::config::legacy().with_limit::<SAFE_SER_SIZE_LIMIT>()
}

pub fn serialize<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, wire_config())
        .map_err(|e| anyhow_error_and_log(format!("Failed to serialize value: {e}")))
}

/// Deserializes a value, rejecting trailing bytes and oversized inputs.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, wire_config())
        .map_err(|e| anyhow_error_and_log(format!("Failed to deserialize value: {e}")))?;
    if read != bytes.len() {
        return Err(anyhow_error_and_log(format!(
            "Trailing bytes after value: read {read} of {}",
            bytes.len()
        )));
    }
    Ok(value)
}

/// a value that is sent via network
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(bound = "")]
pub enum NetworkValue<S: MheScheme> {
    /// Aggregator to participant: contribute a share to this instance.
    ProtocolRequest {
        descriptor: ProtocolDescriptor,
        attempt: u32,
        /// Nonce of this round, echoed back with the share.
        round: u64,
        input: ProtocolInput<S>,
    },
    Share {
        protocol: ProtocolId,
        round: u64,
        share: S::Share,
    },
    Aggregate {
        protocol: ProtocolId,
        kind: ProtocolKind,
        result: Result<AggregatedResult<S>, ProtocolError>,
    },
    /// Helper to input owner: provide the encrypted input `label` of circuit `circuit`.
    InputRequest {
        circuit: CircuitId,
        label: OperandLabel,
    },
    InputResponse {
        circuit: CircuitId,
        label: OperandLabel,
        result: Result<S::Ciphertext, String>,
    },
    /// The helper will not submit any further circuits.
    ComputeClosed,
}

impl<S: MheScheme> NetworkValue<S> {
    pub fn to_network(&self) -> anyhow::Result<Vec<u8>> {
        serialize(self)
    }

    pub fn from_network(serialized: &[u8]) -> anyhow::Result<Self> {
        deserialize(serialized)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            NetworkValue::ProtocolRequest { .. } => "ProtocolRequest",
            NetworkValue::Share { .. } => "Share",
            NetworkValue::Aggregate { .. } => "Aggregate",
            NetworkValue::InputRequest { .. } => "InputRequest",
            NetworkValue::InputResponse { .. } => "InputResponse",
            NetworkValue::ComputeClosed => "ComputeClosed",
        }
    }
}
