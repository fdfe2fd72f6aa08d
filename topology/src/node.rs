use crate::errors::ClusterError;
use crate::http::{build_client, send, send_json};
use crate::types::NodeInfo;
use serde_json::Value;
use std::time::Duration;

/// Client for the status port of SQL and KV nodes.
#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new(timeout: Duration) -> Self {
        NodeClient {
            client: build_client(timeout),
        }
    }

    fn config_url(node: &NodeInfo) -> String {
        format!("http://{}/config", node.status_address())
    }

    pub async fn get_config(&self, node: &NodeInfo) -> Result<Value, ClusterError> {
        let url = Self::config_url(node);
        send_json(self.client.get(&url), &url).await
    }

    pub async fn set_config(&self, node: &NodeInfo, update: &Value) -> Result<(), ClusterError> {
        let url = Self::config_url(node);
        send(self.client.post(&url).json(update), &url).await?;
        Ok(())
    }
}
