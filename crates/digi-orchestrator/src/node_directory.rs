// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide directory of hypervisor nodes.
//!
//! Populated when the worker starts and refreshed on a miss. It is a cache
//! of the `servers` table and never authoritative: [`NodeDirectory::refresh`]
//! rebuilds it from persistence at any time.

use std::collections::HashMap;
use std::sync::Arc;

use digi_clients::NodeCredentials;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::persistence::{NodeRecord, Persistence};

/// Cached hypervisor node records keyed by node id.
pub struct NodeDirectory {
    persistence: Arc<dyn Persistence>,
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeDirectory {
    /// Empty directory backed by `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Reload every node. Returns the number of nodes known afterwards.
    pub async fn refresh(&self) -> Result<usize> {
        let records = self.persistence.list_nodes().await?;
        let fresh: HashMap<String, NodeRecord> = records
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();
        let count = fresh.len();
        *self.nodes.write().await = fresh;
        debug!(nodes = count, "Node directory refreshed");
        Ok(count)
    }

    /// Node by id, reloading once on a miss.
    pub async fn get(&self, node_id: &str) -> Result<NodeRecord> {
        if let Some(node) = self.nodes.read().await.get(node_id) {
            return Ok(node.clone());
        }
        self.refresh().await?;
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Node", node_id))
    }

    /// Hypervisor credentials of a node.
    pub async fn credentials(&self, node_id: &str) -> Result<NodeCredentials> {
        Ok(self.get(node_id).await?.credentials())
    }

    /// Number of cached nodes.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Whether no node is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryPersistence, NodeStatus};

    fn node(id: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            name: format!("pve-{}", id),
            hostname: format!("{}.hv.local", id),
            port: 8006,
            api_token_id: "root@pam!digi".to_string(),
            api_token_secret: "secret".to_string(),
            region: "eu".to_string(),
            status: NodeStatus::Active,
            max_vms: 50,
        }
    }

    #[tokio::test]
    async fn test_miss_triggers_reload() {
        let store = Arc::new(MemoryPersistence::new());
        let directory = NodeDirectory::new(store.clone());
        assert!(directory.is_empty().await);

        store.insert_node(&node("n1")).await.unwrap();

        let found = directory.get("n1").await.unwrap();
        assert_eq!(found.name, "pve-n1");
        assert_eq!(directory.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let directory = NodeDirectory::new(Arc::new(MemoryPersistence::new()));
        assert!(matches!(
            directory.get("nope").await.unwrap_err(),
            Error::NotFound { entity: "Node", .. }
        ));
    }

    #[tokio::test]
    async fn test_credentials_use_node_api() {
        let store = Arc::new(MemoryPersistence::new());
        store.insert_node(&node("n1")).await.unwrap();
        let directory = NodeDirectory::new(store);
        directory.refresh().await.unwrap();

        let creds = directory.credentials("n1").await.unwrap();
        assert_eq!(creds.api_url, "https://n1.hv.local:8006/api2/json");
        assert_eq!(creds.node, "pve-n1");
    }
}
