//! SQL access to the cluster as a given database user.

use crate::errors::ClusterError;
use crate::registry::DeploymentRegistry;
use crate::types::{NodeInfo, NodeKind, NodeStatus};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError};
use sqlx::{ConnectOptions, Connection, Row};
use std::sync::Arc;
use std::time::Duration;

/// MySQL error number for "access denied for user".
const ER_ACCESS_DENIED: u16 = 1045;

#[derive(thiserror::Error, Debug)]
pub enum SqlError {
    #[error("access denied for user")]
    AccessDenied(#[source] sqlx::Error),

    #[error("could not connect to sql node {0}")]
    Connect(String, #[source] sqlx::Error),

    #[error("timed out connecting to sql node {0}")]
    ConnectTimeout(String),

    #[error("query failed")]
    Query(#[source] sqlx::Error),

    #[error("no sql node is available")]
    NoSqlNode,

    #[error("could not list sql nodes")]
    Registry(#[source] ClusterError),

    #[error("unsupported value for a global variable: {0}")]
    UnsupportedValue(String),
}

/// An open connection authenticated as one database user.
#[async_trait]
pub trait SqlSession: Send {
    /// The SQL node this session is connected to.
    fn node(&self) -> &NodeInfo;

    async fn show_grants(&mut self) -> Result<Vec<String>, SqlError>;

    async fn global_variables(&mut self) -> Result<Vec<(String, String)>, SqlError>;

    /// `SET GLOBAL <name> = ?`. The caller is responsible for validating `name`.
    async fn set_global_variable(&mut self, name: &str, value: &Value) -> Result<(), SqlError>;
}

#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self, user: &str, password: &str) -> Result<Box<dyn SqlSession>, SqlError>;
}

/// Fixed SQL endpoint used instead of the registry.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SqlEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_status_port")]
    pub status_port: u16,
}

fn default_status_port() -> u16 {
    10080
}

/// Connects over the MySQL protocol to a SQL node taken from the registry, or to
/// a fixed endpoint when one is configured.
pub struct MySqlConnector {
    registry: Arc<dyn DeploymentRegistry>,
    endpoint: Option<SqlEndpoint>,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(
        registry: Arc<dyn DeploymentRegistry>,
        endpoint: Option<SqlEndpoint>,
        connect_timeout: Duration,
    ) -> Self {
        MySqlConnector {
            registry,
            endpoint,
            connect_timeout,
        }
    }

    async fn pick_node(&self) -> Result<NodeInfo, SqlError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(NodeInfo::new(
                NodeKind::Sql,
                endpoint.host.clone(),
                endpoint.port,
                endpoint.status_port,
            ));
        }

        let nodes = self
            .registry
            .list_sql_nodes()
            .await
            .map_err(SqlError::Registry)?;
        nodes
            .into_iter()
            .find(|n| n.status == NodeStatus::Up)
            .ok_or(SqlError::NoSqlNode)
    }
}

#[async_trait]
impl SqlConnector for MySqlConnector {
    async fn connect(&self, user: &str, password: &str) -> Result<Box<dyn SqlSession>, SqlError> {
        let node = self.pick_node().await?;
        let options = MySqlConnectOptions::new()
            .host(&node.ip)
            .port(node.port)
            .username(user)
            .password(password)
            .disable_statement_logging();

        let conn = tokio::time::timeout(self.connect_timeout, MySqlConnection::connect_with(&options))
            .await
            .map_err(|_| SqlError::ConnectTimeout(node.address()))?
            .map_err(|e| classify_connect_error(&node, e))?;

        Ok(Box::new(MySqlSession { node, conn }))
    }
}

fn classify_connect_error(node: &NodeInfo, err: sqlx::Error) -> SqlError {
    let denied = match &err {
        sqlx::Error::Database(db_err) => db_err
            .try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|e| e.number() == ER_ACCESS_DENIED),
        _ => false,
    };
    if denied {
        SqlError::AccessDenied(err)
    } else {
        SqlError::Connect(node.address(), err)
    }
}

struct MySqlSession {
    node: NodeInfo,
    conn: MySqlConnection,
}

#[async_trait]
impl SqlSession for MySqlSession {
    fn node(&self) -> &NodeInfo {
        &self.node
    }

    async fn show_grants(&mut self) -> Result<Vec<String>, SqlError> {
        let rows = sqlx::query("SHOW GRANTS FOR CURRENT_USER()")
            .fetch_all(&mut self.conn)
            .await
            .map_err(SqlError::Query)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(SqlError::Query))
            .collect()
    }

    async fn global_variables(&mut self) -> Result<Vec<(String, String)>, SqlError> {
        let rows = sqlx::query("SHOW GLOBAL VARIABLES")
            .fetch_all(&mut self.conn)
            .await
            .map_err(SqlError::Query)?;
        rows.iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(SqlError::Query)?;
                let value: String = row.try_get(1).map_err(SqlError::Query)?;
                Ok((name, value))
            })
            .collect()
    }

    async fn set_global_variable(&mut self, name: &str, value: &Value) -> Result<(), SqlError> {
        let statement = format!("SET GLOBAL {name} = ?");
        let query = sqlx::query(&statement);
        let query = match value {
            Value::Bool(b) => query.bind(i64::from(*b)),
            Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => query.bind(i),
                (None, Some(u), _) => query.bind(u),
                (None, None, Some(f)) => query.bind(f),
                _ => return Err(SqlError::UnsupportedValue(n.to_string())),
            },
            Value::String(s) => query.bind(s.clone()),
            other => return Err(SqlError::UnsupportedValue(other.to_string())),
        };
        query
            .execute(&mut self.conn)
            .await
            .map_err(SqlError::Query)?;
        Ok(())
    }
}
