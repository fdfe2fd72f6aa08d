use crate::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use shared::errors::{ApiError, ErrorClass};
use topology::errors::ClusterError;
use topology::types::NodeInfo;

#[derive(thiserror::Error, Debug)]
#[error("failed to list cluster topology")]
pub struct ListTopologyError(#[source] ClusterError);

impl ErrorClass for ListTopologyError {
    fn code(&self) -> &'static str {
        "api.topology.list_failed"
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/topology/kv", get(kv_nodes))
        .route("/topology/sql", get(sql_nodes))
}

async fn kv_nodes(State(state): State<AppState>) -> Result<Json<Vec<NodeInfo>>, ApiError> {
    let nodes = state
        .cluster
        .coordinator
        .list_kv_nodes()
        .await
        .map_err(ListTopologyError)?;
    Ok(Json(nodes))
}

async fn sql_nodes(State(state): State<AppState>) -> Result<Json<Vec<NodeInfo>>, ApiError> {
    let nodes = state
        .cluster
        .registry
        .list_sql_nodes()
        .await
        .map_err(ListTopologyError)?;
    Ok(Json(nodes))
}
