//! Cluster-wide configuration: scraped from every node, reconciled per kind,
//! and edited in place on the nodes that own it.

pub mod aggregator;
pub mod editable;

use crate::AppState;
use crate::session::Session;
use crate::session::middleware::require_writeable;
use axum::extract::State;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::errors::{ApiError, ApiJson, ErrorBody, ErrorClass};
use std::collections::BTreeMap;
use std::fmt;
use topology::errors::ClusterError;
use topology::sql::SqlError;

pub use aggregator::ConfigAggregator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    CoordinatorConfig,
    SqlNodeConfig,
    KvNodeConfig,
    SqlGlobalVariable,
}

impl ItemKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ItemKind::CoordinatorConfig => "coordinatorConfig",
            ItemKind::SqlNodeConfig => "sqlNodeConfig",
            ItemKind::KvNodeConfig => "kvNodeConfig",
            ItemKind::SqlGlobalVariable => "sqlGlobalVariable",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to list cluster topology")]
    ListTopologyFailed(#[source] ClusterError),

    #[error("failed to read {kind} from {address}")]
    ScrapeNode {
        kind: ItemKind,
        address: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to read global variables")]
    ScrapeGlobalVariables(#[source] SqlError),

    #[error("the session carries no database credentials")]
    NoDbAuth,

    #[error("{kind} item {id:?} is not editable")]
    NotEditable { kind: ItemKind, id: String },

    #[error("editing {0} is not implemented")]
    EditNotImplemented(ItemKind),

    #[error("failed to edit {kind} on {address}")]
    EditNode {
        kind: ItemKind,
        address: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to set global variable")]
    EditGlobalVariable(#[source] SqlError),
}

impl ErrorClass for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            ConfigError::ListTopologyFailed(_) => "api.configuration.list_topology_failed",
            ConfigError::ScrapeNode { .. }
            | ConfigError::ScrapeGlobalVariables(_)
            | ConfigError::NoDbAuth => "api.configuration.list_config_items_failed",
            ConfigError::NotEditable { .. } => "api.configuration.not_editable",
            ConfigError::EditNotImplemented(_)
            | ConfigError::EditNode { .. }
            | ConfigError::EditGlobalVariable(_) => "api.configuration.edit_failed",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ConfigError::NotEditable { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Renders a non-fatal error the way the error handler would.
pub(crate) fn error_body(error: ConfigError) -> ErrorBody {
    ApiError::from(error).to_body(tracing::enabled!(tracing::Level::DEBUG))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigItem {
    pub id: String,
    pub value: Value,
    pub is_editable: bool,
    pub is_multi_value: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct AllConfigItems {
    pub errors: Vec<ErrorBody>,
    pub items: BTreeMap<ItemKind, Vec<ConfigItem>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EditRequest {
    pub kind: ItemKind,
    pub id: String,
    pub new_value: Value,
}

#[derive(Debug, Default, Serialize)]
pub struct EditResponse {
    pub warnings: Vec<ErrorBody>,
}

pub fn routes() -> Router<AppState> {
    let writes = Router::new()
        .route("/configuration/edit", post(edit))
        .route_layer(from_fn(require_writeable));

    Router::new()
        .route("/configuration/all", get(all))
        .merge(writes)
}

async fn all(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<AllConfigItems>, ApiError> {
    Ok(Json(state.configuration.get_all(&session).await?))
}

async fn edit(
    State(state): State<AppState>,
    session: Session,
    ApiJson(request): ApiJson<EditRequest>,
) -> Result<Json<EditResponse>, ApiError> {
    Ok(Json(state.configuration.edit(&session, &request).await?))
}
