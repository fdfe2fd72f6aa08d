//! Deployment registry kept in the coordinator's embedded metadata store.
//!
//! Components register themselves under `/topology/<component>/...`. The registry is
//! read through the metadata store's JSON gateway (`/v3/kv/range`), which takes and
//! returns base64 encoded keys and values.

use crate::errors::ClusterError;
use crate::http::{build_client, send_json};
use crate::types::{NodeInfo, NodeKind, NodeStatus, split_host_port};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

const SQL_NODE_PREFIX: &str = "/topology/tidb/";
const PROMETHEUS_KEY: &str = "/topology/prometheus";

/// Address of a deployed metrics server.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PrometheusInfo {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub deploy_path: String,
}

impl PrometheusInfo {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

#[async_trait]
pub trait DeploymentRegistry: Send + Sync {
    async fn list_sql_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;
    async fn get_prometheus(&self) -> Result<Option<PrometheusInfo>, ClusterError>;
}

#[derive(Deserialize)]
struct RangeKv {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RangeKv>,
}

#[derive(Deserialize)]
struct SqlNodeRecord {
    #[serde(default)]
    version: String,
    status_port: u16,
}

/// Registry client speaking to the metadata store gateway.
pub struct MetadataStoreRegistry {
    client: reqwest::Client,
    url: String,
}

impl MetadataStoreRegistry {
    pub fn new(coordinator_url: &str, timeout: Duration) -> Self {
        MetadataStoreRegistry {
            client: build_client(timeout),
            url: format!("{}/v3/kv/range", coordinator_url.trim_end_matches('/')),
        }
    }

    async fn range(
        &self,
        key: &str,
        prefix: bool,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        let mut body = json!({"key": STANDARD.encode(key)});
        if prefix {
            body["range_end"] = STANDARD.encode(prefix_end(key.as_bytes())).into();
        }

        let response: RangeResponse =
            send_json(self.client.post(&self.url).json(&body), &self.url).await?;

        let decode = |field: &str, raw: &str| {
            STANDARD
                .decode(raw)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .map_err(|e| ClusterError::MalformedEntry {
                    key: key.to_string(),
                    detail: format!("{field}: {e}"),
                })
        };

        response
            .kvs
            .into_iter()
            .map(|kv| Ok((decode("key", &kv.key)?, decode("value", &kv.value)?)))
            .collect()
    }
}

/// Smallest key greater than every key with the given prefix.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: range to the end of the keyspace
    vec![0]
}

#[async_trait]
impl DeploymentRegistry for MetadataStoreRegistry {
    async fn list_sql_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let entries = self.range(SQL_NODE_PREFIX, true).await?;

        let mut alive = HashSet::new();
        let mut records = Vec::new();
        for (key, value) in &entries {
            let rest = &key[SQL_NODE_PREFIX.len()..];
            if let Some(addr) = rest.strip_suffix("/ttl") {
                alive.insert(addr.to_string());
            } else if let Some(addr) = rest.strip_suffix("/info") {
                records.push((addr.to_string(), value));
            }
        }

        let mut nodes = Vec::with_capacity(records.len());
        for (addr, value) in records {
            let Some((ip, port)) = split_host_port(&addr) else {
                tracing::warn!(%addr, "skipping sql node with malformed address");
                continue;
            };
            let record: SqlNodeRecord =
                serde_json::from_str(value).map_err(|e| ClusterError::MalformedEntry {
                    key: format!("{SQL_NODE_PREFIX}{addr}/info"),
                    detail: e.to_string(),
                })?;
            let status = if alive.contains(&addr) {
                NodeStatus::Up
            } else {
                NodeStatus::Down
            };
            nodes.push(NodeInfo {
                kind: NodeKind::Sql,
                ip,
                port,
                status_port: record.status_port,
                version: record.version,
                status,
            });
        }

        Ok(nodes)
    }

    async fn get_prometheus(&self) -> Result<Option<PrometheusInfo>, ClusterError> {
        let entries = self.range(PROMETHEUS_KEY, false).await?;
        let Some(value) = entries.get(PROMETHEUS_KEY) else {
            return Ok(None);
        };
        let info = serde_json::from_str(value).map_err(|e| ClusterError::MalformedEntry {
            key: PROMETHEUS_KEY.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Some(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeServer;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"/topology/tidb/"), b"/topology/tidb0".to_vec());
        assert_eq!(prefix_end(&[0x61, 0xff]), vec![0x62]);
        assert_eq!(prefix_end(&[0xff]), vec![0]);
    }

    #[tokio::test]
    async fn test_list_sql_nodes() {
        let server = FakeServer::spawn().await;
        server.put_kv(
            "/topology/tidb/10.0.0.1:4000/info",
            r#"{"version":"7.5.0","status_port":10080}"#,
        );
        server.put_kv("/topology/tidb/10.0.0.1:4000/ttl", "1700000000000000000");
        server.put_kv(
            "/topology/tidb/10.0.0.2:4000/info",
            r#"{"version":"7.5.0","status_port":10080}"#,
        );
        server.put_kv("/topology/prometheus", r#"{"ip":"10.0.0.9","port":9090}"#);

        let registry = MetadataStoreRegistry::new(&server.url(), Duration::from_secs(5));
        let nodes = registry.list_sql_nodes().await.unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].address(), "10.0.0.1:4000");
        assert_eq!(nodes[0].status, NodeStatus::Up);
        assert_eq!(nodes[0].status_port, 10080);
        assert_eq!(nodes[1].status, NodeStatus::Down);
    }

    #[tokio::test]
    async fn test_get_prometheus() {
        let server = FakeServer::spawn().await;
        let registry = MetadataStoreRegistry::new(&server.url(), Duration::from_secs(5));
        assert_eq!(registry.get_prometheus().await.unwrap(), None);

        server.put_kv(
            "/topology/prometheus",
            r#"{"ip":"10.0.0.9","port":9090,"deploy_path":"/deploy"}"#,
        );
        let info = registry.get_prometheus().await.unwrap().unwrap();
        assert_eq!(info.url(), "http://10.0.0.9:9090");
    }
}
