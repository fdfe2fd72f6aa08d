//! Sign in, sign out and session introspection.

pub mod sql_auth;
pub mod verify;

use crate::AppState;
use crate::session::middleware::BearerToken;
use crate::session::{AuthType, LoginForm, Session, SignOutInfo, TokenResponse};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shared::errors::{ApiError, ApiJson, ApiQuery};

#[derive(Debug, Serialize)]
pub struct LoginInfo {
    pub supported_auth_types: Vec<AuthType>,
    /// Base64 SPKI key the sign-in form may encrypt passwords with.
    pub sql_auth_public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct SignOutQuery {
    #[serde(default)]
    pub redirect_url: String,
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub display_name: String,
    pub is_shareable: bool,
    pub is_writeable: bool,
    pub auth_from: AuthType,
}

/// Served without a session.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/user/login_info", get(login_info))
        .route("/user/login", post(login))
        .route("/user/refresh_token", post(refresh_token))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/user/sign_out_info", get(sign_out_info))
        .route("/user/info", get(info))
}

async fn login_info(State(state): State<AppState>) -> Json<LoginInfo> {
    Json(LoginInfo {
        supported_auth_types: state.gate.registry.enabled_types().await,
        sql_auth_public_key: state.login_key.public_key_base64().to_string(),
    })
}

async fn login(
    State(state): State<AppState>,
    ApiJson(form): ApiJson<LoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    Ok(Json(state.gate.login(&form).await?))
}

async fn refresh_token(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<TokenResponse>, ApiError> {
    // The session must still be accepted by its authenticator
    state.gate.verify(&token).await?;
    Ok(Json(state.gate.signer.refresh(&token)?))
}

async fn sign_out_info(
    State(state): State<AppState>,
    session: Session,
    ApiQuery(query): ApiQuery<SignOutQuery>,
) -> Result<Json<SignOutInfo>, ApiError> {
    Ok(Json(
        state
            .gate
            .sign_out_info(&session, &query.redirect_url)
            .await?,
    ))
}

async fn info(session: Session) -> Json<UserInfo> {
    Json(UserInfo {
        display_name: session.display_name,
        is_shareable: session.is_shareable,
        is_writeable: session.is_writeable,
        auth_from: session.auth_from,
    })
}
