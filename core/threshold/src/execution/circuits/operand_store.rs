use std::sync::Arc;
use std::time::Duration;

use async_cell::sync::AsyncCell;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use super::OperandLabel;
use crate::error::CircuitError;
use crate::scheme::MheScheme;

/// What a read of an absent operand does.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReadPolicy {
    /// Wait until the operand is written, up to the read timeout.
    #[default]
    Block,
    FailFast,
}

/// Write-once, read-many ciphertext store of a session.
pub struct OperandStore<S: MheScheme> {
    cells: DashMap<OperandLabel, Arc<AsyncCell<S::Ciphertext>>>,
    written: DashSet<OperandLabel>,
    policy: ReadPolicy,
    read_timeout: Duration,
    cancel: CancellationToken,
}

impl<S: MheScheme> OperandStore<S> {
    pub fn new(policy: ReadPolicy, read_timeout: Duration, cancel: CancellationToken) -> Self {
        OperandStore {
            cells: DashMap::new(),
            written: DashSet::new(),
            policy,
            read_timeout,
            cancel,
        }
    }

    fn cell(&self, label: &OperandLabel) -> Arc<AsyncCell<S::Ciphertext>> {
        Arc::clone(
            self.cells
                .entry(label.clone())
                .or_insert_with(AsyncCell::shared)
                .value(),
        )
    }

    pub fn contains(&self, label: &OperandLabel) -> bool {
        self.written.contains(label)
    }

    pub fn put(&self, label: OperandLabel, ciphertext: S::Ciphertext) -> Result<(), CircuitError> {
        if !self.written.insert(label.clone()) {
            return Err(CircuitError::DuplicateOperand(label));
        }
        tracing::debug!("Storing operand {label}");
        self.cell(&label).set(ciphertext);
        Ok(())
    }

    pub async fn get(&self, label: &OperandLabel) -> Result<S::Ciphertext, CircuitError> {
        match self.policy {
            ReadPolicy::FailFast => self
                .cells
                .get(label)
                .and_then(|cell| cell.try_get())
                .ok_or_else(|| CircuitError::MissingOperand(label.clone())),
            ReadPolicy::Block => {
                let cell = self.cell(label);
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(CircuitError::Cancelled),
                    read = tokio::time::timeout(self.read_timeout, cell.get()) => {
                        read.map_err(|_| CircuitError::MissingOperand(label.clone()))
                    }
                }
            }
        }
    }
}
