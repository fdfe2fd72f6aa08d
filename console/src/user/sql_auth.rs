use super::verify::verify_db_user;
use crate::metrics_defs::SIGN_IN_FAILURES;
use crate::session::rsa_key::{LoginKey, LoginKeyError};
use crate::session::{Authenticator, LoginForm, Session};
use async_trait::async_trait;
use http::StatusCode;
use shared::counter;
use shared::errors::{ApiError, ErrorClass};
use std::sync::Arc;
use topology::Cluster;

/// Value of `extra` telling that the password is encrypted with the login key.
pub const RSA_PASSWORD: &str = "rsa";

#[derive(thiserror::Error, Debug)]
pub enum SqlAuthError {
    #[error("username is required")]
    EmptyUsername,
    #[error("could not read the encrypted password")]
    Password(#[source] LoginKeyError),
}

impl ErrorClass for SqlAuthError {
    fn code(&self) -> &'static str {
        match self {
            SqlAuthError::EmptyUsername => "api.user.signin.empty_username",
            SqlAuthError::Password(_) => "api.user.signin.invalid_password",
        }
    }

    fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

/// Signs in with database credentials.
pub struct SqlAuthenticator {
    cluster: Cluster,
    login_key: Arc<LoginKey>,
}

impl SqlAuthenticator {
    pub fn new(cluster: Cluster, login_key: Arc<LoginKey>) -> Self {
        SqlAuthenticator { cluster, login_key }
    }

    fn password(&self, form: &LoginForm) -> Result<String, SqlAuthError> {
        if form.extra == RSA_PASSWORD {
            self.login_key
                .decrypt_base64(&form.password)
                .map_err(SqlAuthError::Password)
        } else {
            Ok(form.password.clone())
        }
    }
}

#[async_trait]
impl Authenticator for SqlAuthenticator {
    async fn authenticate(&self, form: &LoginForm) -> Result<Session, ApiError> {
        if form.username.is_empty() {
            return Err(SqlAuthError::EmptyUsername.into());
        }
        let password = self.password(form)?;

        let writeable = verify_db_user(
            self.cluster.sql.as_ref(),
            &self.cluster.nodes,
            &form.username,
            &password,
        )
        .await
        .inspect_err(|e| {
            counter!(SIGN_IN_FAILURES, "auth_type" => "sql").increment(1);
            tracing::info!(user = %form.username, error = %e, "database sign in rejected");
        })?;

        Ok(Session::with_db_auth(&form.username, &password, writeable))
    }
}
