use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifier of a node, unique within a session.
///
/// The aggregator (helper) has a `NodeId` as well, but it is not part of the session node list.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Node ids `node-0..node-(n-1)` used by the demo and the test harness.
pub fn generate_node_ids(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId(format!("node-{i}"))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_order() {
        let ids = generate_node_ids(3);
        assert_eq!(ids[1].to_string(), "node-1");
        assert!(ids[0] < ids[2]);
        assert_eq!(NodeId::from("cloud").as_str(), "cloud");
    }

    #[test]
    fn serializes_as_string() {
        let bytes = crate::networking::value::serialize(&NodeId::from("node-0")).unwrap();
        let plain = crate::networking::value::serialize(&"node-0".to_string()).unwrap();
        assert_eq!(bytes, plain);
    }
}
