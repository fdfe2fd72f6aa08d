use super::{Session, SessionGate};
use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::header::AUTHORIZATION;
use http::request::Parts;
use shared::errors::{ApiError, EdgeError};
use std::sync::Arc;

fn bearer_token(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Verifies the bearer token and attaches the session to the request.
pub async fn authenticate(
    State(gate): State<Arc<SessionGate>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .map(str::to_string)
        .ok_or(EdgeError::Unauthenticated)?;
    let session = gate.verify(&token).await?;
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

pub async fn require_shareable(request: Request, next: Next) -> Result<Response, ApiError> {
    let session = request
        .extensions()
        .get::<Session>()
        .ok_or(EdgeError::Unauthenticated)?;
    if !session.is_shareable {
        return Err(EdgeError::Forbidden("session is not shareable".into()).into());
    }
    Ok(next.run(request).await)
}

pub async fn require_writeable(request: Request, next: Next) -> Result<Response, ApiError> {
    let session = request
        .extensions()
        .get::<Session>()
        .ok_or(EdgeError::Unauthenticated)?;
    if !session.is_writeable {
        return Err(EdgeError::Forbidden("session is read only".into()).into());
    }
    Ok(next.run(request).await)
}

impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or_else(|| EdgeError::Unauthenticated.into())
    }
}

/// The raw bearer token of the request, for endpoints that reissue it.
pub struct BearerToken(pub String);

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        bearer_token(&parts.headers)
            .map(|t| BearerToken(t.to_string()))
            .ok_or_else(|| EdgeError::Unauthenticated.into())
    }
}
