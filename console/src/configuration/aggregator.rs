use super::editable::is_editable;
use super::{
    AllConfigItems, ConfigError, ConfigItem, EditRequest, EditResponse, ItemKind, error_body,
};
use crate::flatten::{FlatMap, flatten};
use crate::metrics_defs::{CONFIG_EDITS, CONFIG_SCRAPE_ERRORS};
use crate::session::Session;
use futures::future::join_all;
use serde_json::{Map, Value};
use shared::counter;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use topology::Cluster;
use topology::sql::SqlConnector;

/// What a scrape worker reports back. Every worker sends exactly one.
enum ChannelItem {
    Scraped { kind: ItemKind, values: FlatMap },
    Failed { kind: ItemKind, error: ConfigError },
}

fn spawn_worker<F>(tx: &mpsc::Sender<ChannelItem>, kind: ItemKind, scrape: F)
where
    F: Future<Output = Result<FlatMap, ConfigError>> + Send + 'static,
{
    let tx = tx.clone();
    tokio::spawn(async move {
        let item = match scrape.await {
            Ok(values) => ChannelItem::Scraped { kind, values },
            Err(error) => ChannelItem::Failed { kind, error },
        };
        let _ = tx.send(item).await;
    });
}

struct KeyState {
    first_value: Value,
    occurs: usize,
    identical: bool,
}

#[derive(Default)]
struct KindState {
    expected_occurs: usize,
    keys: BTreeMap<String, KeyState>,
}

/// Merges the flat maps of every source of a kind into one item per key.
#[derive(Default)]
struct Reconciler {
    kinds: BTreeMap<ItemKind, KindState>,
}

impl Reconciler {
    fn add(&mut self, kind: ItemKind, values: FlatMap) {
        let state = self.kinds.entry(kind).or_default();
        state.expected_occurs += 1;
        for (key, value) in values {
            match state.keys.get_mut(&key) {
                None => {
                    state.keys.insert(
                        key,
                        KeyState {
                            first_value: value,
                            occurs: 1,
                            identical: true,
                        },
                    );
                }
                Some(existing) => {
                    existing.occurs += 1;
                    existing.identical &= existing.first_value == value;
                }
            }
        }
    }

    /// Items come out sorted by id. A key absent from some sources is only
    /// flagged as multi-valued when the sources that report it disagree.
    fn finish(self) -> BTreeMap<ItemKind, Vec<ConfigItem>> {
        self.kinds
            .into_iter()
            .map(|(kind, state)| {
                debug_assert!(state.keys.values().all(|k| k.occurs <= state.expected_occurs));
                let items = state
                    .keys
                    .into_iter()
                    .map(|(id, key)| ConfigItem {
                        is_editable: is_editable(kind, &id),
                        id,
                        value: key.first_value,
                        is_multi_value: !key.identical,
                    })
                    .collect();
                (kind, items)
            })
            .collect()
    }
}

async fn scrape_global_variables(
    sql: Arc<dyn SqlConnector>,
    user: String,
    password: String,
) -> Result<FlatMap, ConfigError> {
    let mut conn = sql
        .connect(&user, &password)
        .await
        .map_err(ConfigError::ScrapeGlobalVariables)?;
    let variables = conn
        .global_variables()
        .await
        .map_err(ConfigError::ScrapeGlobalVariables)?;
    Ok(variables
        .into_iter()
        .map(|(name, value)| (name, Value::String(value)))
        .collect())
}

/// Reads and edits configuration across the whole cluster.
#[derive(Clone)]
pub struct ConfigAggregator {
    cluster: Cluster,
}

impl ConfigAggregator {
    pub fn new(cluster: Cluster) -> Self {
        ConfigAggregator { cluster }
    }

    /// Scrapes every source concurrently. Only a failure to list the topology
    /// is fatal; a source that cannot be read becomes an entry in `errors`.
    pub async fn get_all(&self, session: &Session) -> Result<AllConfigItems, ConfigError> {
        let (kv_nodes, sql_nodes) = tokio::try_join!(
            self.cluster.coordinator.list_kv_nodes(),
            self.cluster.registry.list_sql_nodes(),
        )
        .map_err(ConfigError::ListTopologyFailed)?;

        let expected = 2 + sql_nodes.len() + kv_nodes.len();
        let (tx, mut rx) = mpsc::channel(expected);

        let coordinator = self.cluster.coordinator.clone();
        spawn_worker(&tx, ItemKind::CoordinatorConfig, async move {
            let address = coordinator.base_url().to_string();
            coordinator
                .get_config()
                .await
                .map(|config| flatten(&config))
                .map_err(|source| ConfigError::ScrapeNode {
                    kind: ItemKind::CoordinatorConfig,
                    address,
                    source,
                })
        });

        let sql = self.cluster.sql.clone();
        let credentials = session
            .has_db_auth
            .then(|| (session.db_username.clone(), session.db_password.clone()));
        spawn_worker(&tx, ItemKind::SqlGlobalVariable, async move {
            let (user, password) = credentials.ok_or(ConfigError::NoDbAuth)?;
            scrape_global_variables(sql, user, password).await
        });

        let nodes = sql_nodes
            .into_iter()
            .map(|n| (ItemKind::SqlNodeConfig, n))
            .chain(kv_nodes.into_iter().map(|n| (ItemKind::KvNodeConfig, n)));
        for (kind, node) in nodes {
            let client = self.cluster.nodes.clone();
            spawn_worker(&tx, kind, async move {
                client
                    .get_config(&node)
                    .await
                    .map(|config| flatten(&config))
                    .map_err(|source| ConfigError::ScrapeNode {
                        kind,
                        address: node.status_address(),
                        source,
                    })
            });
        }
        drop(tx);

        let mut reconciler = Reconciler::default();
        let mut errors = Vec::new();
        for _ in 0..expected {
            let Some(item) = rx.recv().await else {
                tracing::error!("configuration scrape worker exited without reporting");
                break;
            };
            match item {
                ChannelItem::Scraped { kind, values } => reconciler.add(kind, values),
                ChannelItem::Failed { kind, error } => {
                    counter!(CONFIG_SCRAPE_ERRORS, "kind" => kind.as_str()).increment(1);
                    tracing::warn!(kind = %kind, error = %error, "configuration scrape failed");
                    errors.push(error_body(error));
                }
            }
        }

        Ok(AllConfigItems {
            errors,
            items: reconciler.finish(),
        })
    }

    pub async fn edit(
        &self,
        session: &Session,
        request: &EditRequest,
    ) -> Result<EditResponse, ConfigError> {
        let kind = request.kind;
        if !is_editable(kind, &request.id) {
            return Err(ConfigError::NotEditable {
                kind,
                id: request.id.clone(),
            });
        }

        let mut update = Map::new();
        update.insert(request.id.clone(), request.new_value.clone());
        let update = Value::Object(update);

        let result = match kind {
            ItemKind::CoordinatorConfig => self
                .cluster
                .coordinator
                .set_config(&update)
                .await
                .map(|()| EditResponse::default())
                .map_err(|source| ConfigError::EditNode {
                    kind,
                    address: self.cluster.coordinator.base_url().to_string(),
                    source,
                }),
            ItemKind::KvNodeConfig => self.edit_kv_nodes(&update).await,
            ItemKind::SqlGlobalVariable => self
                .set_global_variable(session, &request.id, &request.new_value)
                .await
                .map(|()| EditResponse::default()),
            ItemKind::SqlNodeConfig => Err(ConfigError::EditNotImplemented(kind)),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        counter!(CONFIG_EDITS, "kind" => kind.as_str(), "status" => status).increment(1);
        if result.is_ok() {
            tracing::info!(kind = %kind, id = %request.id, "edited configuration");
        }
        result
    }

    /// Applies `update` on every KV node. Fails only when every node fails.
    async fn edit_kv_nodes(&self, update: &Value) -> Result<EditResponse, ConfigError> {
        let nodes = self
            .cluster
            .coordinator
            .list_kv_nodes()
            .await
            .map_err(ConfigError::ListTopologyFailed)?;

        let results = join_all(nodes.iter().map(|node| async move {
            self.cluster
                .nodes
                .set_config(node, update)
                .await
                .map_err(|source| ConfigError::EditNode {
                    kind: ItemKind::KvNodeConfig,
                    address: node.status_address(),
                    source,
                })
        }))
        .await;

        let total = results.len();
        let failures: Vec<ConfigError> = results.into_iter().filter_map(Result::err).collect();
        if failures.len() == total {
            if let Some(first) = failures.into_iter().next() {
                return Err(first);
            }
            return Ok(EditResponse::default());
        }

        for failure in &failures {
            tracing::warn!(error = %failure, "configuration edit partially failed");
        }
        Ok(EditResponse {
            warnings: failures.into_iter().map(error_body).collect(),
        })
    }

    async fn set_global_variable(
        &self,
        session: &Session,
        name: &str,
        value: &Value,
    ) -> Result<(), ConfigError> {
        if !session.has_db_auth {
            return Err(ConfigError::NoDbAuth);
        }
        let mut conn = self
            .cluster
            .sql
            .connect(&session.db_username, &session.db_password)
            .await
            .map_err(ConfigError::EditGlobalVariable)?;
        conn.set_global_variable(name, value)
            .await
            .map_err(ConfigError::EditGlobalVariable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeCluster;
    use serde_json::json;
    use topology::testutils::FakeServer;
    use topology::types::{NodeInfo, NodeKind};

    fn root() -> Session {
        Session::with_db_auth("root", "", true)
    }

    fn item<'a>(all: &'a AllConfigItems, kind: ItemKind, id: &str) -> &'a ConfigItem {
        all.items[&kind].iter().find(|i| i.id == id).unwrap()
    }

    async fn sql_nodes(fake: &FakeCluster, configs: &[Value]) -> Vec<FakeServer> {
        let mut servers = Vec::new();
        let mut nodes = Vec::new();
        for (i, config) in configs.iter().enumerate() {
            let server = FakeServer::spawn().await;
            server.set_config(config.clone());
            nodes.push(NodeInfo::new(
                NodeKind::Sql,
                "127.0.0.1",
                4000 + i as u16,
                server.port(),
            ));
            servers.push(server);
        }
        fake.registry.set_sql_nodes(nodes);
        servers
    }

    async fn kv_nodes(fake: &FakeCluster, count: usize) -> Vec<FakeServer> {
        let mut servers = Vec::new();
        let mut stores = Vec::new();
        for i in 0..count {
            let server = FakeServer::spawn().await;
            stores.push(json!({"store": {
                "address": format!("127.0.0.1:{}", 20160 + i),
                "status_address": format!("127.0.0.1:{}", server.port()),
                "state_name": "Up",
            }}));
            servers.push(server);
        }
        fake.coordinator.set_stores(json!({"stores": stores}));
        servers
    }

    #[tokio::test]
    async fn test_multi_value_detection() {
        let fake = FakeCluster::spawn().await;
        let _servers = sql_nodes(
            &fake,
            &[json!({"foo": "a"}), json!({"foo": "a"}), json!({"foo": "b"})],
        )
        .await;
        let aggregator = ConfigAggregator::new(fake.cluster.clone());

        let all = aggregator.get_all(&root()).await.unwrap();
        assert!(all.errors.is_empty());
        assert_eq!(
            item(&all, ItemKind::SqlNodeConfig, "foo"),
            &ConfigItem {
                id: "foo".into(),
                value: json!("a"),
                is_editable: false,
                is_multi_value: true,
            }
        );

        let _servers = sql_nodes(
            &fake,
            &[json!({"foo": "a"}), json!({"foo": "a"}), json!({"foo": "a"})],
        )
        .await;
        let all = aggregator.get_all(&root()).await.unwrap();
        assert!(!item(&all, ItemKind::SqlNodeConfig, "foo").is_multi_value);
    }

    #[tokio::test]
    async fn test_all_kinds_sorted_and_editable() {
        let fake = FakeCluster::spawn().await;
        fake.coordinator.set_config(json!({
            "schedule": {"leader-schedule-limit": 4, "region-schedule-limit": 2048},
            "log": {"level": "info"},
        }));
        let kv = kv_nodes(&fake, 1).await;
        kv[0].set_config(json!({"gc": {"batch-keys": 512}, "a": {"b": [1, 2]}}));
        let _sql = sql_nodes(&fake, &[json!({"log": {"level": "warn"}})]).await;
        fake.sql.set_variables(&[("tidb_gc_life_time", "10m0s"), ("autocommit", "ON")]);

        let all = ConfigAggregator::new(fake.cluster.clone())
            .get_all(&root())
            .await
            .unwrap();
        assert!(all.errors.is_empty());

        let ids: Vec<_> = all.items[&ItemKind::CoordinatorConfig]
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(
            ids,
            [
                "log.level",
                "schedule.leader-schedule-limit",
                "schedule.region-schedule-limit"
            ]
        );
        assert!(item(&all, ItemKind::CoordinatorConfig, "schedule.leader-schedule-limit").is_editable);
        assert!(!item(&all, ItemKind::CoordinatorConfig, "log.level").is_editable);
        assert!(item(&all, ItemKind::KvNodeConfig, "gc.batch-keys").is_editable);
        assert_eq!(item(&all, ItemKind::KvNodeConfig, "a.b").value, json!("[1,2]"));
        assert_eq!(
            item(&all, ItemKind::SqlGlobalVariable, "tidb_gc_life_time").value,
            json!("10m0s")
        );
        assert!(!item(&all, ItemKind::SqlGlobalVariable, "autocommit").is_editable);

        let body = serde_json::to_value(&all).unwrap();
        assert!(body["items"]["sqlNodeConfig"].is_array());
        assert_eq!(body["items"]["kvNodeConfig"][0]["is_multi_value"], false);
    }

    #[tokio::test]
    async fn test_scrape_errors_are_not_fatal() {
        let fake = FakeCluster::spawn().await;
        let servers = sql_nodes(&fake, &[json!({"foo": "a"}), json!({"foo": "b"})]).await;
        servers[1].set_get_status(500);

        let session = Session {
            has_db_auth: false,
            ..root()
        };
        let all = ConfigAggregator::new(fake.cluster.clone())
            .get_all(&session)
            .await
            .unwrap();

        assert_eq!(all.errors.len(), 2);
        assert!(
            all.errors
                .iter()
                .all(|e| e.code == "api.configuration.list_config_items_failed")
        );
        assert!(!item(&all, ItemKind::SqlNodeConfig, "foo").is_multi_value);
        assert!(!all.items.contains_key(&ItemKind::SqlGlobalVariable));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_multi_value() {
        let fake = FakeCluster::spawn().await;
        let _servers = sql_nodes(&fake, &[json!({"foo": "a", "bar": 1}), json!({"foo": "a"})]).await;
        let all = ConfigAggregator::new(fake.cluster.clone())
            .get_all(&root())
            .await
            .unwrap();
        assert!(!item(&all, ItemKind::SqlNodeConfig, "bar").is_multi_value);
    }

    #[tokio::test]
    async fn test_topology_failure_is_fatal() {
        let fake = FakeCluster::spawn().await;
        fake.registry.set_fail(true);
        let err = ConfigAggregator::new(fake.cluster.clone())
            .get_all(&root())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::ListTopologyFailed(_)));
    }

    #[tokio::test]
    async fn test_edit_kv_partial_failure() {
        let fake = FakeCluster::spawn().await;
        let kv = kv_nodes(&fake, 2).await;
        kv[1].set_post_status(500);
        let aggregator = ConfigAggregator::new(fake.cluster.clone());
        let request = EditRequest {
            kind: ItemKind::KvNodeConfig,
            id: "gc.batch-keys".into(),
            new_value: json!(256),
        };

        let response = aggregator.edit(&root(), &request).await.unwrap();
        assert_eq!(response.warnings.len(), 1);
        assert_eq!(response.warnings[0].code, "api.configuration.edit_failed");
        assert_eq!(kv[0].posted_configs(), vec![json!({"gc.batch-keys": 256})]);

        kv[0].set_post_status(500);
        let err = aggregator.edit(&root(), &request).await.unwrap_err();
        match err {
            ConfigError::EditNode { address, .. } => {
                assert_eq!(address, format!("127.0.0.1:{}", kv[0].port()))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edit_single_targets() {
        let fake = FakeCluster::spawn().await;
        let aggregator = ConfigAggregator::new(fake.cluster.clone());

        aggregator
            .edit(
                &root(),
                &EditRequest {
                    kind: ItemKind::CoordinatorConfig,
                    id: "schedule.leader-schedule-limit".into(),
                    new_value: json!(8),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            fake.coordinator.posted_configs(),
            vec![json!({"schedule.leader-schedule-limit": 8})]
        );

        aggregator
            .edit(
                &root(),
                &EditRequest {
                    kind: ItemKind::SqlGlobalVariable,
                    id: "tidb_gc_life_time".into(),
                    new_value: json!("20m"),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            fake.sql.set_calls(),
            vec![("tidb_gc_life_time".to_string(), json!("20m"))]
        );

        let err = aggregator
            .edit(
                &root(),
                &EditRequest {
                    kind: ItemKind::SqlNodeConfig,
                    id: "log.level".into(),
                    new_value: json!("warn"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotEditable { .. }));
    }
}
