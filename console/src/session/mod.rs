//! Operator sessions.
//!
//! A [`Session`] is minted by one of the registered [`Authenticator`]s and shipped
//! to the client as an opaque signed token (see [`token`]). Every request carrying
//! the token is verified by [`middleware::authenticate`].

pub mod middleware;
pub mod rsa_key;
pub mod token;

use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use shared::errors::{ApiError, ErrorClass};
use std::collections::BTreeMap;
use std::sync::Arc;
use token::SessionSigner;

/// Schema tag of the serialized session. Tokens carrying another version are rejected.
pub const SESSION_VERSION: &str = "v2";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AuthType {
    SqlUser = 0,
    SharingCode = 1,
    Sso = 2,
}

impl From<AuthType> for u8 {
    fn from(value: AuthType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for AuthType {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AuthType::SqlUser),
            1 => Ok(AuthType::SharingCode),
            2 => Ok(AuthType::Sso),
            other => Err(SessionError::UnsupportedAuthType(other)),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("unsupported auth type {0}")]
    UnsupportedAuthType(u8),
    #[error("auth type {0} is disabled")]
    Disabled(u8),
    #[error("session is no longer valid")]
    Rejected,
}

impl ErrorClass for SessionError {
    fn code(&self) -> &'static str {
        match self {
            SessionError::UnsupportedAuthType(_) => "api.user.unsupported_auth_type",
            SessionError::Disabled(_) => "api.user.auth_type_disabled",
            SessionError::Rejected => "common.unauthenticated",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SessionError::UnsupportedAuthType(_) | SessionError::Disabled(_) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::Rejected => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub version: String,
    pub has_db_auth: bool,
    pub db_username: String,
    pub db_password: String,
    pub display_name: String,
    pub is_shareable: bool,
    pub is_writeable: bool,
    pub auth_from: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_id_token: Option<String>,
}

impl Session {
    /// A session backed by database credentials.
    pub fn with_db_auth(username: &str, password: &str, is_writeable: bool) -> Self {
        Session {
            version: SESSION_VERSION.to_string(),
            has_db_auth: true,
            db_username: username.to_string(),
            db_password: password.to_string(),
            display_name: username.to_string(),
            is_shareable: true,
            is_writeable,
            auth_from: AuthType::SqlUser,
            oidc_id_token: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(rename = "type")]
    pub auth_type: u8,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub extra: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SignOutInfo {
    pub end_session_url: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    /// Unix seconds.
    pub expire_at: i64,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn is_enabled(&self) -> Result<bool, ApiError> {
        Ok(true)
    }

    async fn authenticate(&self, form: &LoginForm) -> Result<Session, ApiError>;

    /// Whether a previously minted session may still be used.
    async fn process_session(&self, _session: &Session) -> bool {
        true
    }

    async fn sign_out_info(
        &self,
        _session: &Session,
        _redirect_url: &str,
    ) -> Result<SignOutInfo, ApiError> {
        Ok(SignOutInfo::default())
    }
}

#[derive(Default)]
pub struct AuthenticatorRegistry {
    authenticators: BTreeMap<AuthType, Arc<dyn Authenticator>>,
}

impl AuthenticatorRegistry {
    pub fn register(&mut self, auth_type: AuthType, authenticator: Arc<dyn Authenticator>) {
        self.authenticators.insert(auth_type, authenticator);
    }

    pub fn get(&self, auth_type: AuthType) -> Option<&Arc<dyn Authenticator>> {
        self.authenticators.get(&auth_type)
    }

    /// Registered types that are currently enabled.
    pub async fn enabled_types(&self) -> Vec<AuthType> {
        let mut types = Vec::new();
        for (auth_type, authenticator) in &self.authenticators {
            match authenticator.is_enabled().await {
                Ok(true) => types.push(*auth_type),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    auth_type = *auth_type as u8,
                    error = %e,
                    "could not check whether authenticator is enabled"
                ),
            }
        }
        types
    }
}

/// Verifies tokens against the authenticators that minted them.
pub struct SessionGate {
    pub signer: SessionSigner,
    pub registry: AuthenticatorRegistry,
}

impl SessionGate {
    pub fn new(signer: SessionSigner, registry: AuthenticatorRegistry) -> Self {
        SessionGate { signer, registry }
    }

    pub async fn login(&self, form: &LoginForm) -> Result<TokenResponse, ApiError> {
        let auth_type = AuthType::try_from(form.auth_type)?;
        let authenticator = self
            .registry
            .get(auth_type)
            .ok_or(SessionError::UnsupportedAuthType(form.auth_type))?;
        if !authenticator.is_enabled().await? {
            return Err(SessionError::Disabled(form.auth_type).into());
        }

        let mut session = authenticator.authenticate(form).await?;
        session.auth_from = auth_type;
        session.version = SESSION_VERSION.to_string();

        let issued = self.signer.issue(&session)?;
        tracing::info!(
            user = %session.display_name,
            auth_type = auth_type as u8,
            "operator signed in"
        );
        Ok(issued)
    }

    /// Resolves a token into a live session.
    pub async fn verify(&self, token: &str) -> Result<Session, ApiError> {
        let session = self.signer.verify(token)?.0;
        let authenticator = self
            .registry
            .get(session.auth_from)
            .ok_or(SessionError::Rejected)?;
        if !authenticator.process_session(&session).await {
            return Err(SessionError::Rejected.into());
        }
        Ok(session)
    }

    pub async fn sign_out_info(
        &self,
        session: &Session,
        redirect_url: &str,
    ) -> Result<SignOutInfo, ApiError> {
        let authenticator = self
            .registry
            .get(session.auth_from)
            .ok_or(SessionError::Rejected)?;
        authenticator.sign_out_info(session, redirect_url).await
    }
}
