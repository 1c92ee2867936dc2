//! In-process shelter clusters.

use shelter_mesh::{MeshHub, NodeConfig, ShelterNode, ShelterService};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Poll `check` every 20ms until it returns true or `timeout` passes.
pub async fn eventually_within<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// [`eventually_within`] with a 5 second budget.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    eventually_within(Duration::from_secs(5), check).await
}

/// Nodes sharing one mesh, each with its own snapshot file.
pub struct TestCluster {
    pub hub: MeshHub,
    dir: TempDir,
    nodes: BTreeMap<String, ShelterNode>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            hub: MeshHub::new(),
            dir: TempDir::new().expect("tempdir"),
            nodes: BTreeMap::new(),
        }
    }

    pub fn db_path(&self, node_id: &str) -> String {
        self.dir
            .path()
            .join(format!("{}.db", node_id))
            .to_string_lossy()
            .into_owned()
    }

    /// Fast-timer config whose store lives in this cluster's tempdir.
    pub fn config(&self, node_id: &str) -> NodeConfig {
        NodeConfig::for_testing(node_id, &self.db_path(node_id))
    }

    pub async fn start(&mut self, node_id: &str) -> Arc<ShelterService> {
        let config = self.config(node_id);
        self.start_with(config).await
    }

    pub async fn start_with(&mut self, config: NodeConfig) -> Arc<ShelterService> {
        let node_id = config.shelter.node_id.clone();
        let mut node = ShelterNode::new(config, Arc::new(self.hub.clone())).expect("valid config");
        node.start().await.expect("node starts");
        let service = node.service().expect("running node has a service");
        self.nodes.insert(node_id, node);
        service
    }

    pub fn node(&self, node_id: &str) -> &ShelterNode {
        self.nodes.get(node_id).expect("node exists")
    }

    /// Shut a node down and forget it. Its snapshot file stays.
    pub async fn stop(&mut self, node_id: &str) {
        if let Some(mut node) = self.nodes.remove(node_id) {
            node.shutdown().await;
        }
    }

    pub async fn shutdown(&mut self) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
