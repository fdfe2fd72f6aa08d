//! Clients for the cluster the console observes: the coordinator, the deployment
//! registry, node status ports, and SQL access as a database user.

pub mod config;
pub mod coordinator;
pub mod errors;
mod http;
pub mod node;
pub mod registry;
pub mod sql;
#[doc(hidden)]
pub mod testutils;
pub mod types;

use config::ClusterConfig;
use coordinator::CoordinatorClient;
use node::NodeClient;
use registry::{DeploymentRegistry, MetadataStoreRegistry};
use sql::{MySqlConnector, SqlConnector};
use std::sync::Arc;

/// Handles to every part of the cluster.
#[derive(Clone)]
pub struct Cluster {
    pub coordinator: CoordinatorClient,
    pub registry: Arc<dyn DeploymentRegistry>,
    pub nodes: NodeClient,
    pub sql: Arc<dyn SqlConnector>,
}

impl Cluster {
    pub fn from_config(config: &ClusterConfig) -> Self {
        let timeout = config.request_timeout();
        let registry: Arc<dyn DeploymentRegistry> =
            Arc::new(MetadataStoreRegistry::new(&config.coordinator_url, timeout));
        let sql = Arc::new(MySqlConnector::new(
            registry.clone(),
            config.sql_endpoint.clone(),
            timeout,
        ));

        Cluster {
            coordinator: CoordinatorClient::new(&config.coordinator_url, timeout),
            registry,
            nodes: NodeClient::new(timeout),
            sql,
        }
    }
}
