use crate::errors::ClusterError;
use crate::http::{build_client, send, send_json};
use crate::types::{NodeInfo, NodeKind, NodeStatus, split_host_port};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const CONFIG_PATH: &str = "pd/api/v1/config";
const STORES_PATH: &str = "pd/api/v1/stores";

#[derive(Deserialize)]
struct StoreLabel {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct StoreMeta {
    address: String,
    #[serde(default)]
    status_address: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    state_name: String,
    #[serde(default)]
    labels: Vec<StoreLabel>,
}

#[derive(Deserialize)]
struct StoreEntry {
    store: StoreMeta,
}

#[derive(Deserialize)]
struct StoresResponse {
    #[serde(default)]
    stores: Vec<StoreEntry>,
}

/// HTTP client for the placement/metadata coordinator.
#[derive(Clone)]
pub struct CoordinatorClient {
    client: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        CoordinatorClient {
            client: build_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Fetches the full nested configuration.
    pub async fn get_config(&self) -> Result<Value, ClusterError> {
        let url = self.url(CONFIG_PATH);
        send_json(self.client.get(&url), &url).await
    }

    /// Applies a (partial) configuration update.
    pub async fn set_config(&self, update: &Value) -> Result<(), ClusterError> {
        let url = self.url(CONFIG_PATH);
        send(self.client.post(&url).json(update), &url).await?;
        Ok(())
    }

    /// Lists storage nodes, skipping columnar replicas and tombstones.
    pub async fn list_kv_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let url = self.url(STORES_PATH);
        let response: StoresResponse = send_json(self.client.get(&url), &url).await?;

        let mut nodes = Vec::with_capacity(response.stores.len());
        for entry in response.stores {
            let store = entry.store;
            let is_columnar = store
                .labels
                .iter()
                .any(|l| l.key == "engine" && l.value == "tiflash");
            if is_columnar {
                continue;
            }

            let status = store_status(&store.state_name);
            if status == NodeStatus::Tombstone {
                continue;
            }

            let Some((ip, port)) = split_host_port(&store.address) else {
                tracing::warn!(address = %store.address, "skipping store with malformed address");
                continue;
            };
            let status_port = split_host_port(&store.status_address)
                .map(|(_, p)| p)
                .unwrap_or(0);

            nodes.push(NodeInfo {
                kind: NodeKind::Kv,
                ip,
                port,
                status_port,
                version: store.version,
                status,
            });
        }

        nodes.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));
        Ok(nodes)
    }
}

fn store_status(state_name: &str) -> NodeStatus {
    match state_name {
        "Up" => NodeStatus::Up,
        "Disconnected" | "Down" => NodeStatus::Down,
        "Offline" => NodeStatus::Offline,
        "Tombstone" => NodeStatus::Tombstone,
        _ => NodeStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeServer;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_kv_nodes() {
        let server = FakeServer::spawn().await;
        server.set_stores(json!({
            "count": 3,
            "stores": [
                {"store": {"address": "10.0.0.2:20160", "status_address": "10.0.0.2:20180", "version": "7.5.0", "state_name": "Up"}},
                {"store": {"address": "10.0.0.1:20160", "status_address": "10.0.0.1:20180", "state_name": "Disconnected"}},
                {"store": {"address": "10.0.0.3:20160", "status_address": "10.0.0.3:20180", "state_name": "Tombstone"}},
                {"store": {"address": "10.0.0.4:3930", "status_address": "10.0.0.4:20292", "state_name": "Up",
                           "labels": [{"key": "engine", "value": "tiflash"}]}}
            ]
        }));

        let client = CoordinatorClient::new(&server.url(), Duration::from_secs(5));
        let nodes = client.list_kv_nodes().await.unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].ip, "10.0.0.1");
        assert_eq!(nodes[0].status, NodeStatus::Down);
        assert_eq!(nodes[1].status_port, 20180);
        assert_eq!(nodes[1].version, "7.5.0");
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let server = FakeServer::spawn().await;
        server.set_config(json!({"pd-server": {"metric-storage": "http://prom:9090"}}));

        let client = CoordinatorClient::new(&format!("{}/", server.url()), Duration::from_secs(5));
        let config = client.get_config().await.unwrap();
        assert_eq!(config["pd-server"]["metric-storage"], "http://prom:9090");

        client
            .set_config(&json!({"metric-storage": "http://other:9090"}))
            .await
            .unwrap();
        assert_eq!(
            server.posted_configs(),
            vec![json!({"metric-storage": "http://other:9090"})]
        );
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = FakeServer::spawn().await;
        server.set_post_status(500);

        let client = CoordinatorClient::new(&server.url(), Duration::from_secs(5));
        let err = client.set_config(&json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, ClusterError::Status { status: 500, .. }));
    }
}
