use super::config::SsoConfig;
use super::impersonation::Impersonation;
use crate::AppState;
use crate::session::middleware::require_writeable;
use axum::extract::State;
use axum::middleware::from_fn;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use shared::errors::{ApiError, ApiJson, ApiQuery};

#[derive(Debug, Deserialize)]
pub struct AuthUrlQuery {
    pub redirect_url: String,
    #[serde(default)]
    pub state: String,
    pub code_verifier: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateImpersonationRequest {
    pub sql_user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub config: SsoConfig,
}

/// Served before sign in.
pub fn public_routes() -> Router<AppState> {
    Router::new().route("/user/sso/auth_url", get(auth_url))
}

pub fn routes() -> Router<AppState> {
    let writes = Router::new()
        .route("/user/sso/impersonation", post(create_impersonation))
        .route("/user/sso/config", put(set_config))
        .route_layer(from_fn(require_writeable));

    Router::new()
        .route("/user/sso/impersonations/list", get(list_impersonations))
        .route("/user/sso/config", get(get_config))
        .merge(writes)
}

async fn auth_url(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<AuthUrlQuery>,
) -> Result<Json<String>, ApiError> {
    let url = state
        .sso
        .auth_url(&query.redirect_url, &query.state, &query.code_verifier)
        .await?;
    Ok(Json(url))
}

async fn list_impersonations(
    State(state): State<AppState>,
) -> Result<Json<Vec<Impersonation>>, ApiError> {
    Ok(Json(state.sso.list_impersonations().await?))
}

async fn create_impersonation(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateImpersonationRequest>,
) -> Result<Json<Impersonation>, ApiError> {
    let created = state
        .sso
        .create_impersonation(&request.sql_user, &request.password)
        .await?;
    Ok(Json(created))
}

async fn get_config(State(state): State<AppState>) -> Result<Json<SsoConfig>, ApiError> {
    Ok(Json(state.sso.config().await?))
}

async fn set_config(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SetConfigRequest>,
) -> Result<Json<SsoConfig>, ApiError> {
    Ok(Json(state.sso.update_config(request.config).await?))
}
