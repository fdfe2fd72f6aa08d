//! The console API service: cluster configuration, metrics, log search and
//! operator sessions behind one HTTP router.

pub mod config;
pub mod configuration;
pub mod crypto;
pub mod flatten;
pub mod logs;
pub mod metrics_defs;
pub mod prometheus;
pub mod session;
pub mod sso;
#[cfg(test)]
pub(crate) mod testutils;
pub mod topology_api;
pub mod user;

use axum::Router;
use axum::middleware::from_fn_with_state;
use config::ConsoleConfig;
use configuration::ConfigAggregator;
use logsearch::store::StoreError;
use logsearch::{GrpcLogStreamClient, LogStreamClient, Scheduler, SchedulerError, TaskStore};
use prometheus::PromResolver;
use session::middleware::authenticate;
use session::rsa_key::{LoginKey, LoginKeyError};
use session::token::SessionSigner;
use session::{AuthType, AuthenticatorRegistry, SessionGate};
use shared::admin_service::admin_router;
use shared::http::run_http_service;
use sqlx::SqlitePool;
use sso::Sso;
use sso::authenticator::SsoAuthenticator;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use topology::Cluster;
use user::sql_auth::SqlAuthenticator;

pub const LOGIN_KEY_BITS: usize = 2048;
const LOG_RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ConsoleError {
    #[error("invalid config: {0}")]
    Config(#[from] config::ValidationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not open the local database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("could not set up sso: {0}")]
    Sso(#[from] sso::SsoError),
    #[error("could not set up log search storage: {0}")]
    LogStore(#[from] StoreError),
    #[error("could not recover log search state: {0}")]
    Recover(#[from] SchedulerError),
    #[error("could not generate the login key: {0}")]
    LoginKey(#[from] LoginKeyError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Cluster,
    pub gate: Arc<SessionGate>,
    pub login_key: Arc<LoginKey>,
    pub configuration: ConfigAggregator,
    pub prom: PromResolver,
    pub http: reqwest::Client,
    pub sso: Arc<Sso>,
    pub scheduler: Scheduler,
}

impl AppState {
    pub async fn build(
        config: &ConsoleConfig,
        cluster: Cluster,
        db: SqlitePool,
        log_client: Arc<dyn LogStreamClient>,
        signer: SessionSigner,
        login_key: LoginKey,
    ) -> Result<Self, ConsoleError> {
        let login_key = Arc::new(login_key);
        let sso = Arc::new(Sso::new(db.clone(), &config.data_dir, cluster.clone()).await?);

        let mut registry = AuthenticatorRegistry::default();
        registry.register(
            AuthType::SqlUser,
            Arc::new(SqlAuthenticator::new(cluster.clone(), login_key.clone())),
        );
        registry.register(AuthType::Sso, Arc::new(SsoAuthenticator::new(sso.clone())));

        let store = TaskStore::new(db).await?;
        let scheduler = Scheduler::new(store, log_client, config.temp_dir.clone());

        Ok(AppState {
            gate: Arc::new(SessionGate::new(signer, registry)),
            login_key,
            configuration: ConfigAggregator::new(cluster.clone()),
            prom: PromResolver::new(cluster.coordinator.clone(), cluster.registry.clone()),
            http: reqwest::Client::new(),
            sso,
            scheduler,
            cluster,
        })
    }
}

/// The API router with every route mounted under `api_prefix`.
pub fn router(state: AppState, api_prefix: &str) -> Router {
    let authenticated = Router::new()
        .merge(user::routes())
        .merge(sso::api::routes())
        .merge(configuration::routes())
        .merge(prometheus::routes())
        .merge(logs::routes())
        .merge(topology_api::routes())
        .route_layer(from_fn_with_state(state.gate.clone(), authenticate));

    let api = Router::new()
        .merge(user::public_routes())
        .merge(sso::api::public_routes())
        .merge(logs::public_routes())
        .merge(authenticated)
        .with_state(state);

    if api_prefix == "/" {
        api
    } else {
        Router::new().nest(api_prefix, api)
    }
}

/// Recovers interrupted log searches, then serves the API and the admin
/// endpoints until either listener fails.
pub async fn run(config: ConsoleConfig) -> Result<(), ConsoleError> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.temp_dir).await?;

    let db = shared::db::open_local_db(&config.data_dir).await?;
    let login_key = tokio::task::spawn_blocking(|| LoginKey::generate(LOGIN_KEY_BITS)).await??;
    let state = AppState::build(
        &config,
        Cluster::from_config(&config.cluster),
        db,
        Arc::new(GrpcLogStreamClient::new(LOG_RPC_CONNECT_TIMEOUT)),
        SessionSigner::from_env(),
        login_key,
    )
    .await?;

    let ready = Arc::new(AtomicBool::new(false));
    let flag = ready.clone();
    let admin = admin_router(move || flag.load(Ordering::Relaxed));

    state.scheduler.recover().await?;
    ready.store(true, Ordering::Relaxed);

    let scheduler = state.scheduler.clone();
    let api = router(state, &config.api_prefix);
    let served = tokio::try_join!(
        run_http_service(&config.listener, api),
        run_http_service(&config.admin_listener, admin),
    );
    scheduler.shutdown().await;
    served?;
    Ok(())
}
