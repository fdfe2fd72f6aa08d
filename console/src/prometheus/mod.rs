//! Metrics server lookup and a thin query proxy in front of it.

pub mod resolver;

use crate::AppState;
use crate::metrics_defs::PROM_QUERIES;
use crate::session::middleware::require_writeable;
use axum::extract::State;
use axum::middleware::from_fn;
use axum::routing::{get, put};
use axum::{Json, Router};
use http::StatusCode;
use resolver::PromAddresses;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::counter;
use shared::errors::{ApiError, ApiJson, ApiQuery, ErrorClass};
use std::sync::Arc;
use std::time::Duration;
use topology::errors::ClusterError;
use url::Url;

pub use resolver::PromResolver;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum PromError {
    #[error("no metrics server is deployed or configured")]
    NotFound,
    #[error("invalid metrics server address {0:?}")]
    InvalidAddress(String),
    #[error("metrics query failed")]
    QueryFailed(#[source] reqwest::Error),
    #[error("metrics server returned {status}: {body}")]
    QueryRejected { status: StatusCode, body: String },
    #[error("failed to load metrics server address")]
    LoadAddressFailed(#[source] ClusterError),
    #[error("failed to save metrics server address")]
    SaveAddressFailed(#[source] ClusterError),
    #[error(transparent)]
    Shared(Arc<PromError>),
}

impl ErrorClass for PromError {
    fn code(&self) -> &'static str {
        match self {
            PromError::NotFound => "api.metrics.prom_not_found",
            PromError::InvalidAddress(_) => "api.metrics.prom_invalid_address",
            PromError::QueryFailed(_) | PromError::QueryRejected { .. } => {
                "api.metrics.prom_query_failed"
            }
            PromError::LoadAddressFailed(_) => "api.metrics.load_prom_address_failed",
            PromError::SaveAddressFailed(_) => "api.metrics.save_prom_address_failed",
            PromError::Shared(inner) => inner.code(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            PromError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            PromError::Shared(inner) => inner.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueryRequest {
    pub start_time_sec: i64,
    pub end_time_sec: i64,
    pub step_sec: u64,
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct SetAddressRequest {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct SetAddressResponse {
    pub normalized_address: String,
}

/// Runs a range query against the metrics server at `base` and returns its body.
pub async fn query_range(
    client: &reqwest::Client,
    base: &str,
    request: &QueryRequest,
    timeout: Duration,
) -> Result<Value, PromError> {
    let mut url = Url::parse(&format!("{base}/api/v1/query_range"))
        .map_err(|_| PromError::InvalidAddress(base.to_string()))?;
    url.query_pairs_mut()
        .append_pair("query", &request.query)
        .append_pair("start", &request.start_time_sec.to_string())
        .append_pair("end", &request.end_time_sec.to_string())
        .append_pair("step", &request.step_sec.to_string());

    let result = async {
        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(PromError::QueryFailed)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PromError::QueryRejected { status, body });
        }
        response.json::<Value>().await.map_err(PromError::QueryFailed)
    }
    .await;

    let outcome = if result.is_ok() { "ok" } else { "error" };
    counter!(PROM_QUERIES, "status" => outcome).increment(1);
    result
}

pub fn routes() -> Router<AppState> {
    let writes = Router::new()
        .route("/metrics/prom_address", put(set_address))
        .route_layer(from_fn(require_writeable));

    Router::new()
        .route("/metrics/query", get(query))
        .route("/metrics/prom_address", get(get_address))
        .merge(writes)
}

async fn query(
    State(state): State<AppState>,
    ApiQuery(request): ApiQuery<QueryRequest>,
) -> Result<Json<Value>, ApiError> {
    let base = state.prom.resolve().await?;
    if base.is_empty() {
        return Err(PromError::NotFound.into());
    }
    Ok(Json(
        query_range(&state.http, &base, &request, QUERY_TIMEOUT).await?,
    ))
}

async fn get_address(State(state): State<AppState>) -> Result<Json<PromAddresses>, ApiError> {
    Ok(Json(state.prom.addresses().await?))
}

async fn set_address(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SetAddressRequest>,
) -> Result<Json<SetAddressResponse>, ApiError> {
    let normalized_address = state.prom.set_custom(&request.address).await?;
    Ok(Json(SetAddressResponse { normalized_address }))
}
