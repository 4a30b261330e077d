//! File and environment configuration of a node.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::telemetry::TracingConf;
use super::Settings;
use crate::error::ConfigError;
use crate::execution::circuits::operand_store::ReadPolicy;
use crate::execution::compute::ComputeConfig;
use crate::execution::protocols::executor::ExecutorConfig;
use crate::execution::runtime::party::NodeId;
use crate::execution::runtime::session::SessionParameters;
use crate::networking::sending::RetryConfig;
use crate::node::NodeConfig;
use crate::scheme::reference::{ReferenceParameters, MAX_LOG_SLOTS, MAX_PLAINTEXT_MODULUS};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_node_conf"))]
pub struct NodeConf {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub helper_id: String,
    #[validate(nested)]
    pub session: SessionConf,
    #[serde(default)]
    #[validate(nested)]
    pub setup: ExecutorConf,
    #[serde(default)]
    #[validate(nested)]
    pub compute: ComputeConf,
    #[serde(default)]
    #[validate(nested)]
    pub transport: RetryConf,
    #[validate(nested)]
    pub tracing: Option<TracingConf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SessionConf {
    #[validate(length(min = 1))]
    pub id: String,
    pub threshold: usize,
    #[validate(length(min = 1))]
    pub public_seed: String,
    #[validate(length(min = 1))]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    #[validate(nested)]
    pub parameters: ParametersConf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub id: String,
    pub public_point: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ParametersConf {
    #[validate(range(min = 1, max = MAX_LOG_SLOTS))]
    pub log_slots: u32,
    #[validate(range(min = 2, max = MAX_PLAINTEXT_MODULUS))]
    pub plaintext_modulus: u64,
}

impl Default for ParametersConf {
    fn default() -> Self {
        let defaults = ReferenceParameters::default();
        ParametersConf {
            log_slots: defaults.log_slots,
            plaintext_modulus: defaults.plaintext_modulus,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConf {
    #[validate(range(min = 1))]
    pub max_proto_per_node: usize,
    #[validate(range(min = 1))]
    pub max_participation: usize,
    #[validate(range(min = 1))]
    pub max_aggregation: usize,
    #[validate(range(min = 1))]
    pub round_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub max_attempts: u32,
}

impl Default for ExecutorConf {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        ExecutorConf {
            max_proto_per_node: defaults.max_proto_per_node,
            max_participation: defaults.max_participation,
            max_aggregation: defaults.max_aggregation,
            round_timeout_ms: defaults.round_timeout.as_millis() as u64,
            max_attempts: defaults.max_attempts,
        }
    }
}

impl From<&ExecutorConf> for ExecutorConfig {
    fn from(conf: &ExecutorConf) -> Self {
        ExecutorConfig {
            max_proto_per_node: conf.max_proto_per_node,
            max_participation: conf.max_participation,
            max_aggregation: conf.max_aggregation,
            round_timeout: Duration::from_millis(conf.round_timeout_ms),
            max_attempts: conf.max_attempts,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ComputeConf {
    #[validate(nested)]
    pub executor: ExecutorConf,
    #[validate(range(min = 1))]
    pub max_circuit_evaluation: usize,
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    pub input_timeout_ms: u64,
    pub read_policy: ReadPolicy,
    pub read_timeout_ms: u64,
}

impl Default for ComputeConf {
    fn default() -> Self {
        let defaults = ComputeConfig::default();
        ComputeConf {
            executor: ExecutorConf::default(),
            max_circuit_evaluation: defaults.max_circuit_evaluation,
            queue_capacity: defaults.queue_capacity,
            input_timeout_ms: defaults.input_timeout.as_millis() as u64,
            read_policy: defaults.read_policy,
            read_timeout_ms: defaults.read_timeout.as_millis() as u64,
        }
    }
}

impl From<&ComputeConf> for ComputeConfig {
    fn from(conf: &ComputeConf) -> Self {
        ComputeConfig {
            executor: (&conf.executor).into(),
            max_circuit_evaluation: conf.max_circuit_evaluation,
            queue_capacity: conf.queue_capacity,
            input_timeout: Duration::from_millis(conf.input_timeout_ms),
            read_policy: conf.read_policy,
            read_timeout: Duration::from_millis(conf.read_timeout_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConf {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_elapsed_time_ms: u64,
    #[validate(range(min = 1.0))]
    pub multiplier: f64,
}

impl Default for RetryConf {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        RetryConf {
            initial_interval_ms: defaults.initial_interval.as_millis() as u64,
            max_interval_ms: defaults.max_interval.as_millis() as u64,
            max_elapsed_time_ms: defaults.max_elapsed_time.as_millis() as u64,
            multiplier: defaults.multiplier,
        }
    }
}

impl From<&RetryConf> for RetryConfig {
    fn from(conf: &RetryConf) -> Self {
        RetryConfig {
            initial_interval: Duration::from_millis(conf.initial_interval_ms),
            max_interval: Duration::from_millis(conf.max_interval_ms),
            max_elapsed_time: Duration::from_millis(conf.max_elapsed_time_ms),
            multiplier: conf.multiplier,
        }
    }
}

fn invalid(code: &'static str, message: String) -> ValidationError {
    ValidationError::new(code).with_message(message.into())
}

fn validate_node_conf(conf: &NodeConf) -> Result<(), ValidationError> {
    let session = &conf.session;
    let n = session.nodes.len();
    if session.threshold == 0 || session.threshold > n {
        return Err(invalid(
            "threshold",
            format!("threshold {} must lie in 1..={n}", session.threshold),
        ));
    }
    let ids: BTreeSet<&str> = session.nodes.iter().map(|node| node.id.as_str()).collect();
    if ids.len() != n {
        return Err(invalid("nodes", "node ids must be unique".to_string()));
    }
    let points: BTreeSet<u64> = session.nodes.iter().map(|node| node.public_point).collect();
    if points.len() != n || points.contains(&0) {
        return Err(invalid(
            "public_point",
            "public points must be unique and non-zero".to_string(),
        ));
    }
    if ids.contains(conf.helper_id.as_str()) {
        return Err(invalid(
            "helper_id",
            format!("helper {} must not be a session node", conf.helper_id),
        ));
    }
    if conf.id != conf.helper_id && !ids.contains(conf.id.as_str()) {
        return Err(invalid(
            "id",
            format!("{} is neither a session node nor the helper", conf.id),
        ));
    }
    Ok(())
}

impl NodeConf {
    /// Reads `path`, if given, under `MHE_`-prefixed environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let conf: NodeConf = match path {
            Some(path) => Settings::builder().path(path).build().init_conf()?,
            None => Settings::builder().build().init_conf()?,
        };
        conf.validate()?;
        Ok(conf)
    }

    pub fn into_node_config(self) -> Result<NodeConfig<ReferenceParameters>, ConfigError> {
        self.validate()?;
        let public_points: BTreeMap<NodeId, u64> = self
            .session
            .nodes
            .iter()
            .map(|node| (NodeId::from(node.id.as_str()), node.public_point))
            .collect();
        Ok(NodeConfig {
            id: NodeId::from(self.id),
            helper: NodeId::from(self.helper_id),
            session: SessionParameters {
                nodes: self
                    .session
                    .nodes
                    .iter()
                    .map(|node| NodeId::from(node.id.as_str()))
                    .collect(),
                threshold: self.session.threshold,
                public_seed: self.session.public_seed.into_bytes(),
                scheme: ReferenceParameters {
                    log_slots: self.session.parameters.log_slots,
                    plaintext_modulus: self.session.parameters.plaintext_modulus,
                },
                public_points,
                name: self.session.id,
            },
            setup: (&self.setup).into(),
            compute: (&self.compute).into(),
            retry: (&self.transport).into(),
        })
    }
}
