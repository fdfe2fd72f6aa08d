use super::{Sso, SsoError};
use crate::metrics_defs::SIGN_IN_FAILURES;
use crate::session::{Authenticator, LoginForm, Session, SignOutInfo};
use async_trait::async_trait;
use serde::Deserialize;
use shared::counter;
use shared::errors::ApiError;
use std::sync::Arc;

/// Sign in payload carried in the `extra` field of the login form.
#[derive(Debug, Deserialize)]
struct SsoExtra {
    code: String,
    code_verifier: String,
    redirect_url: String,
}

pub struct SsoAuthenticator {
    sso: Arc<Sso>,
}

impl SsoAuthenticator {
    pub fn new(sso: Arc<Sso>) -> Self {
        SsoAuthenticator { sso }
    }
}

#[async_trait]
impl Authenticator for SsoAuthenticator {
    async fn is_enabled(&self) -> Result<bool, ApiError> {
        Ok(self.sso.config().await?.enabled)
    }

    async fn authenticate(&self, form: &LoginForm) -> Result<Session, ApiError> {
        let extra: SsoExtra = serde_json::from_str(&form.extra).map_err(SsoError::InvalidExtra)?;
        let session = self
            .sso
            .sign_in(&extra.code, &extra.code_verifier, &extra.redirect_url)
            .await
            .inspect_err(|e| {
                counter!(SIGN_IN_FAILURES, "auth_type" => "sso").increment(1);
                tracing::info!(error = %e, "sso sign in rejected");
            })?;
        Ok(session)
    }

    async fn sign_out_info(
        &self,
        session: &Session,
        redirect_url: &str,
    ) -> Result<SignOutInfo, ApiError> {
        let id_token = session.oidc_id_token.as_deref().unwrap_or_default();
        Ok(SignOutInfo {
            end_session_url: self.sso.sign_out_url(id_token, redirect_url).await?,
        })
    }
}
