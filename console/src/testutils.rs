//! In-memory fakes of the cluster seams plus a fully wired application state.

use crate::AppState;
use crate::config::ConsoleConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use topology::Cluster;
use topology::coordinator::CoordinatorClient;
use topology::errors::ClusterError;
use topology::node::NodeClient;
use topology::registry::{DeploymentRegistry, PrometheusInfo};
use topology::sql::{SqlConnector, SqlError, SqlSession};
use topology::testutils::FakeServer;
use topology::types::{NodeInfo, NodeKind};

pub const ROOT_GRANTS: &str = "GRANT ALL PRIVILEGES ON *.* TO 'root'@'%' WITH GRANT OPTION";

#[derive(Default)]
struct RegistryState {
    sql_nodes: Vec<NodeInfo>,
    prometheus: Option<PrometheusInfo>,
    fail: bool,
    prometheus_calls: usize,
}

#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl FakeRegistry {
    pub fn set_sql_nodes(&self, nodes: Vec<NodeInfo>) {
        self.state.lock().unwrap().sql_nodes = nodes;
    }

    pub fn set_prometheus(&self, prometheus: Option<PrometheusInfo>) {
        self.state.lock().unwrap().prometheus = prometheus;
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn prometheus_calls(&self) -> usize {
        self.state.lock().unwrap().prometheus_calls
    }
}

#[async_trait]
impl DeploymentRegistry for FakeRegistry {
    async fn list_sql_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let state = self.state.lock().unwrap();
        if state.fail {
            return Err(ClusterError::InvalidUrl("registry unavailable".into()));
        }
        Ok(state.sql_nodes.clone())
    }

    async fn get_prometheus(&self) -> Result<Option<PrometheusInfo>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.prometheus_calls += 1;
        if state.fail {
            return Err(ClusterError::InvalidUrl("registry unavailable".into()));
        }
        Ok(state.prometheus.clone())
    }
}

struct SqlState {
    node: NodeInfo,
    users: HashMap<String, (String, Vec<String>)>,
    variables: Vec<(String, String)>,
    set_calls: Vec<(String, Value)>,
}

/// SQL connector with a fixed user table. Sessions report `node` as their SQL node.
#[derive(Clone)]
pub struct FakeSqlConnector {
    state: Arc<Mutex<SqlState>>,
}

impl FakeSqlConnector {
    pub fn new(node: NodeInfo) -> Self {
        FakeSqlConnector {
            state: Arc::new(Mutex::new(SqlState {
                node,
                users: HashMap::new(),
                variables: Vec::new(),
                set_calls: Vec::new(),
            })),
        }
    }

    pub fn add_user(&self, user: &str, password: &str, grants: &[&str]) {
        self.state.lock().unwrap().users.insert(
            user.to_string(),
            (
                password.to_string(),
                grants.iter().map(|g| g.to_string()).collect(),
            ),
        );
    }

    pub fn set_variables(&self, variables: &[(&str, &str)]) {
        self.state.lock().unwrap().variables = variables
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn set_calls(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().set_calls.clone()
    }
}

#[async_trait]
impl SqlConnector for FakeSqlConnector {
    async fn connect(&self, user: &str, password: &str) -> Result<Box<dyn SqlSession>, SqlError> {
        let state = self.state.lock().unwrap();
        match state.users.get(user) {
            Some((expected, grants)) if expected == password => Ok(Box::new(FakeSqlSession {
                node: state.node.clone(),
                grants: grants.clone(),
                shared: self.state.clone(),
            })),
            _ => Err(SqlError::AccessDenied(sqlx::Error::Protocol(format!(
                "access denied for user {user}"
            )))),
        }
    }
}

struct FakeSqlSession {
    node: NodeInfo,
    grants: Vec<String>,
    shared: Arc<Mutex<SqlState>>,
}

#[async_trait]
impl SqlSession for FakeSqlSession {
    fn node(&self) -> &NodeInfo {
        &self.node
    }

    async fn show_grants(&mut self) -> Result<Vec<String>, SqlError> {
        Ok(self.grants.clone())
    }

    async fn global_variables(&mut self) -> Result<Vec<(String, String)>, SqlError> {
        Ok(self.shared.lock().unwrap().variables.clone())
    }

    async fn set_global_variable(&mut self, name: &str, value: &Value) -> Result<(), SqlError> {
        self.shared
            .lock()
            .unwrap()
            .set_calls
            .push((name.to_string(), value.clone()));
        Ok(())
    }
}

/// A cluster whose coordinator is `coordinator` and whose single SQL node serves
/// its status port from `sql_status`.
pub struct FakeCluster {
    pub coordinator: FakeServer,
    pub sql_status: FakeServer,
    pub registry: FakeRegistry,
    pub sql: FakeSqlConnector,
    pub cluster: Cluster,
}

impl FakeCluster {
    pub async fn spawn() -> Self {
        let coordinator = FakeServer::spawn().await;
        let sql_status = FakeServer::spawn().await;
        let sql_node = NodeInfo::new(NodeKind::Sql, "127.0.0.1", 4000, sql_status.port());

        let registry = FakeRegistry::default();
        registry.set_sql_nodes(vec![sql_node.clone()]);
        let sql = FakeSqlConnector::new(sql_node);
        sql.add_user("root", "", &[ROOT_GRANTS]);

        let timeout = std::time::Duration::from_secs(5);
        let cluster = Cluster {
            coordinator: CoordinatorClient::new(&coordinator.url(), timeout),
            registry: Arc::new(registry.clone()),
            nodes: NodeClient::new(timeout),
            sql: Arc::new(sql.clone()),
        };

        FakeCluster {
            coordinator,
            sql_status,
            registry,
            sql,
            cluster,
        }
    }
}

/// Application state over a fake cluster, an in-memory database and a
/// temporary data directory.
pub struct TestApp {
    pub fake: FakeCluster,
    pub state: AppState,
    pub dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let fake = FakeCluster::spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConsoleConfig::for_tests(&fake.coordinator.url());
        config.data_dir = dir.path().join("data");
        config.temp_dir = dir.path().join("tmp");

        let db = shared::db::open_memory_db().await.unwrap();
        let state = AppState::build(
            &config,
            fake.cluster.clone(),
            db,
            Arc::new(logsearch::GrpcLogStreamClient::new(
                std::time::Duration::from_millis(200),
            )),
            crate::session::token::SessionSigner::new(crate::crypto::random_key()),
            crate::session::rsa_key::LoginKey::generate(1024).unwrap(),
        )
        .await
        .unwrap();

        TestApp { fake, state, dir }
    }
}
