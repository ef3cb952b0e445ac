//! Reference `NodeDirectory` (`tunnox_core::contracts::NodeDirectory`): a
//! static table of node id → bridge gRPC address, handed in at construction.
//! A real cluster's directory is expected to be backed by service discovery
//! (DNS, Consul, the cloud-control plane's own client registry); this one
//! exists so the cross-node splice path (`tunnox-core::broker`) can be
//! exercised without one.

use std::collections::HashMap;

use async_trait::async_trait;
use tunnox_types::CoreError;

use tunnox_core::contracts::NodeDirectory;

pub struct StaticNodeDirectory {
    addresses: HashMap<String, String>,
}

impl StaticNodeDirectory {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        StaticNodeDirectory { addresses }
    }
}

#[async_trait]
impl NodeDirectory for StaticNodeDirectory {
    async fn grpc_address(&self, node_id: &str) -> Result<String, CoreError> {
        self.addresses
            .get(node_id)
            .cloned()
            .ok_or_else(|| CoreError::internal(format!("no known bridge address for node {node_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_a_known_node() {
        let mut addresses = HashMap::new();
        addresses.insert("node-a".to_string(), "http://127.0.0.1:9000".to_string());
        let directory = StaticNodeDirectory::new(addresses);

        assert_eq!(directory.grpc_address("node-a").await.unwrap(), "http://127.0.0.1:9000");
    }

    #[tokio::test]
    async fn unknown_node_is_an_internal_error() {
        let directory = StaticNodeDirectory::new(HashMap::new());
        assert!(directory.grpc_address("node-z").await.is_err());
    }
}
