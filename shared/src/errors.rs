//! Error taxonomy shared by every API surface.
//!
//! Each module keeps its own `thiserror` enum and implements [`ErrorClass`] to give
//! every variant a fully-qualified code (e.g. `api.user.signin.other`) and an HTTP
//! status. Handlers return [`ApiError`], which preserves the cause chain and renders
//! the public body `{error, message, code, full_text}`.
//!
//! Display strings of classified errors should not repeat their source: the public
//! message is built by walking the chain and joining segments with `", caused by: "`.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use http::request::Parts;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error as StdError;
use std::fmt;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Classification of an error for the public API.
pub trait ErrorClass: StdError + Send + Sync + 'static {
    /// Fully-qualified error code.
    fn code(&self) -> &'static str;

    fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Edge buckets that map directly onto HTTP status codes.
#[derive(thiserror::Error, Debug)]
pub enum EdgeError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ErrorClass for EdgeError {
    fn code(&self) -> &'static str {
        match self {
            EdgeError::Unauthenticated => "common.unauthenticated",
            EdgeError::Forbidden(_) => "common.forbidden",
            EdgeError::BadRequest(_) => "common.bad_request",
            EdgeError::NotFound(_) => "common.not_found",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            EdgeError::Unauthenticated => StatusCode::UNAUTHORIZED,
            EdgeError::Forbidden(_) => StatusCode::FORBIDDEN,
            EdgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EdgeError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// An error on its way to the HTTP edge.
pub struct ApiError {
    code: &'static str,
    status: StatusCode,
    inner: BoxError,
}

impl ApiError {
    pub fn new<E>(code: &'static str, status: StatusCode, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        ApiError {
            code,
            status,
            inner: error.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    /// Message composed from the whole cause chain.
    pub fn message(&self) -> String {
        chain_message(self.inner.as_ref())
    }

    pub fn to_body(&self, include_full_text: bool) -> ErrorBody {
        ErrorBody {
            error: true,
            message: self.message(),
            code: self.code.to_string(),
            full_text: include_full_text.then(|| format!("{:?}", self.inner)),
        }
    }
}

impl<E: ErrorClass> From<E> for ApiError {
    fn from(error: E) -> Self {
        ApiError {
            code: error.code(),
            status: error.status(),
            inner: Box::new(error),
        }
    }
}

impl fmt::Debug for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiError")
            .field("code", &self.code)
            .field("status", &self.status)
            .field("inner", &self.inner)
            .finish()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Public error body.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: bool,
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, error = %self.message(), "request failed");
        } else {
            tracing::debug!(code = self.code, error = %self.message(), "request rejected");
        }
        let body = self.to_body(tracing::enabled!(tracing::Level::DEBUG));
        (self.status, Json(body)).into_response()
    }
}

/// Joins the non-empty messages of an error chain with `", caused by: "`.
///
/// A segment that ends with the text of its own cause is trimmed so that
/// errors formatting their source inline are not repeated.
pub fn chain_message(error: &(dyn StdError + 'static)) -> String {
    let mut segments: Vec<String> = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);

    while let Some(err) = current {
        let mut text = err.to_string();
        if let Some(cause) = err.source() {
            let cause_text = cause.to_string();
            if !cause_text.is_empty() && text.ends_with(&cause_text) {
                text.truncate(text.len() - cause_text.len());
                text = text.trim_end_matches([' ', ':']).to_string();
            }
        }
        if !text.is_empty() {
            segments.push(text);
        }
        current = err.source();
    }

    segments.join(", caused by: ")
}

/// JSON body extractor whose rejection is a `BadRequest` error body.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(bad_json(rejection)),
        }
    }
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    EdgeError::BadRequest(rejection.body_text()).into()
}

/// Query string extractor whose rejection is a `BadRequest` error body.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(rejection) => Err(bad_query(rejection)),
        }
    }
}

fn bad_query(rejection: QueryRejection) -> ApiError {
    EdgeError::BadRequest(rejection.body_text()).into()
}
