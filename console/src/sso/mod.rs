//! Single sign-on through an OpenID Connect provider.
//!
//! SSO users do not own database credentials. Once the provider vouches for
//! them they act as the one stored [impersonation](impersonation) user.

pub mod api;
pub mod authenticator;
pub mod config;
pub mod impersonation;
pub mod oidc;

use crate::crypto::CryptoError;
use crate::session::{AuthType, SESSION_VERSION, Session};
use crate::user::verify::{VerifyError, verify_db_user};
use config::{SsoConfig, SsoConfigStore};
use http::StatusCode;
use impersonation::{ImpersonateStatus, Impersonation, ImpersonationStore};
use oidc::{AuthRequest, CodeExchange};
use shared::errors::ErrorClass;
use sqlx::SqlitePool;
use std::path::Path;
use topology::Cluster;

#[derive(thiserror::Error, Debug)]
pub enum SsoError {
    #[error("single sign-on is not enabled")]
    Disabled,
    #[error("no user is available for impersonation")]
    UnsupportedUser,
    #[error("the impersonation credential is not valid")]
    InvalidImpersonateCredential(#[source] VerifyError),
    #[error("could not verify the impersonation credential")]
    Verify(#[source] VerifyError),
    #[error("OIDC discovery failed: {0}")]
    DiscoverFailed(String),
    #[error("invalid sso configuration: {0}")]
    BadConfig(String),
    #[error("OIDC request failed: {0}")]
    OidcInternal(String),
    #[error("invalid sso sign in payload")]
    InvalidExtra(#[source] serde_json::Error),
    #[error("sso storage failed")]
    Storage(#[from] sqlx::Error),
    #[error("stored sso configuration is malformed")]
    Json(#[from] serde_json::Error),
    #[error("could not access the impersonation master key")]
    MasterKey(#[source] std::io::Error),
    #[error("could not seal the impersonation password")]
    Crypto(#[from] CryptoError),
    #[error("stored impersonation is malformed")]
    CorruptImpersonation,
}

impl ErrorClass for SsoError {
    fn code(&self) -> &'static str {
        match self {
            SsoError::Disabled => "api.user.sso.disabled",
            SsoError::UnsupportedUser => "api.user.sso.unsupported_user",
            SsoError::InvalidImpersonateCredential(_) => {
                "api.user.sso.invalid_impersonate_credential"
            }
            SsoError::DiscoverFailed(_) => "api.user.sso.discover_failed",
            SsoError::BadConfig(_) => "api.user.sso.bad_config",
            SsoError::OidcInternal(_) => "api.user.sso.oidc_internal_err",
            SsoError::InvalidExtra(_) => "common.bad_request",
            SsoError::Verify(_)
            | SsoError::Storage(_)
            | SsoError::Json(_)
            | SsoError::MasterKey(_)
            | SsoError::Crypto(_)
            | SsoError::CorruptImpersonation => "api.user.sso.internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SsoError::Disabled | SsoError::UnsupportedUser => StatusCode::FORBIDDEN,
            SsoError::InvalidImpersonateCredential(_)
            | SsoError::DiscoverFailed(_)
            | SsoError::BadConfig(_)
            | SsoError::InvalidExtra(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn classify_verify_error(error: VerifyError) -> SsoError {
    match error {
        VerifyError::DbAuthFailed(_) | VerifyError::InsufficientPrivileges => {
            SsoError::InvalidImpersonateCredential(error)
        }
        other => SsoError::Verify(other),
    }
}

pub struct Sso {
    configs: SsoConfigStore,
    impersonations: ImpersonationStore,
    cluster: Cluster,
    http: reqwest::Client,
}

impl Sso {
    pub async fn new(pool: SqlitePool, data_dir: &Path, cluster: Cluster) -> Result<Self, SsoError> {
        Ok(Sso {
            configs: SsoConfigStore::new(pool.clone()).await?,
            impersonations: ImpersonationStore::new(pool, data_dir).await?,
            cluster,
            http: reqwest::Client::new(),
        })
    }

    pub async fn config(&self) -> Result<SsoConfig, SsoError> {
        self.configs.load().await
    }

    async fn enabled_config(&self) -> Result<SsoConfig, SsoError> {
        let config = self.configs.load().await?;
        if !config.enabled {
            return Err(SsoError::Disabled);
        }
        Ok(config)
    }

    /// Stores new settings. Enabling requires an impersonation and resolves the
    /// provider endpoints through discovery.
    pub async fn update_config(&self, mut config: SsoConfig) -> Result<SsoConfig, SsoError> {
        if config.enabled {
            if !self.impersonations.exists().await? {
                return Err(SsoError::BadConfig(
                    "an impersonation must be created before enabling single sign-on".into(),
                ));
            }
            if config.client_id.is_empty() {
                return Err(SsoError::BadConfig("client_id is required".into()));
            }
            config.discovery_url = oidc::normalize_issuer(&config.discovery_url)?;
            let metadata = oidc::discover(&self.http, &config.discovery_url).await?;
            config.auth_url = metadata.authorization_endpoint;
            config.token_url = metadata.token_endpoint;
            config.user_info_url = metadata.userinfo_endpoint;
            config.sign_out_url = metadata.end_session_endpoint;
        }
        self.configs.save(&config).await?;
        tracing::info!(enabled = config.enabled, "updated sso configuration");
        Ok(config)
    }

    pub async fn auth_url(
        &self,
        redirect_url: &str,
        state: &str,
        code_verifier: &str,
    ) -> Result<String, SsoError> {
        let config = self.enabled_config().await?;
        oidc::auth_url(&AuthRequest {
            auth_url: &config.auth_url,
            client_id: &config.client_id,
            redirect_url,
            scopes: &config.scopes,
            state,
            code_verifier,
        })
    }

    /// Verifies the credential and makes it the only impersonation.
    pub async fn create_impersonation(
        &self,
        sql_user: &str,
        password: &str,
    ) -> Result<Impersonation, SsoError> {
        verify_db_user(
            self.cluster.sql.as_ref(),
            &self.cluster.nodes,
            sql_user,
            password,
        )
        .await
        .map_err(classify_verify_error)?;

        self.impersonations.create(sql_user, password).await?;
        tracing::info!(sql_user, "stored sso impersonation");
        Ok(Impersonation {
            sql_user: sql_user.to_string(),
            last_impersonate_status: None,
        })
    }

    pub async fn list_impersonations(&self) -> Result<Vec<Impersonation>, SsoError> {
        self.impersonations.list().await
    }

    /// Completes the authorization code flow and signs in as the impersonated user.
    pub async fn sign_in(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_url: &str,
    ) -> Result<Session, SsoError> {
        let config = self.enabled_config().await?;
        let tokens = oidc::exchange(
            &self.http,
            &CodeExchange {
                token_url: &config.token_url,
                client_id: &config.client_id,
                client_secret: &config.client_secret,
                redirect_url,
                code,
                code_verifier,
            },
        )
        .await?;
        let user = oidc::user_info(&self.http, &config.user_info_url, &tokens.access_token).await?;

        let (sql_user, password) = self
            .impersonations
            .credential()
            .await?
            .ok_or(SsoError::UnsupportedUser)?;

        let verified = verify_db_user(
            self.cluster.sql.as_ref(),
            &self.cluster.nodes,
            &sql_user,
            &password,
        )
        .await;
        let writeable = match verified {
            Ok(writeable) => {
                self.impersonations
                    .set_status(&sql_user, ImpersonateStatus::Success)
                    .await?;
                writeable
            }
            Err(e) => {
                let status = match &e {
                    VerifyError::DbAuthFailed(_) => ImpersonateStatus::AuthFail,
                    VerifyError::InsufficientPrivileges => ImpersonateStatus::InsufficientPriv,
                    _ => return Err(SsoError::Verify(e)),
                };
                self.impersonations.set_status(&sql_user, status).await?;
                tracing::warn!(sql_user = %sql_user, status = status.as_str(), "sso impersonation rejected");
                return Err(SsoError::InvalidImpersonateCredential(e));
            }
        };

        Ok(Session {
            version: SESSION_VERSION.to_string(),
            has_db_auth: true,
            db_username: sql_user,
            db_password: password,
            display_name: user.email,
            is_shareable: true,
            is_writeable: writeable && !config.is_read_only,
            auth_from: AuthType::Sso,
            oidc_id_token: Some(tokens.id_token),
        })
    }

    /// Provider logout URL, empty when the provider does not offer one.
    pub async fn sign_out_url(&self, id_token: &str, redirect_url: &str) -> Result<String, SsoError> {
        let config = self.enabled_config().await?;
        if config.sign_out_url.is_empty() {
            return Ok(String::new());
        }
        oidc::sign_out_url(&config.sign_out_url, &config.client_id, id_token, redirect_url)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testutils::{FakeCluster, ROOT_GRANTS};
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use http::HeaderMap;
    use http::header::AUTHORIZATION;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    pub(crate) const ACCESS_TOKEN: &str = "access-token";

    #[derive(Default)]
    struct ProviderState {
        base_url: String,
        issuer: Option<String>,
        last_code_verifier: Option<String>,
    }

    type Shared = Arc<Mutex<ProviderState>>;

    /// OIDC provider answering discovery, token and user info requests.
    pub(crate) struct FakeProvider {
        addr: SocketAddr,
        state: Shared,
    }

    impl FakeProvider {
        pub(crate) async fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let state: Shared = Arc::new(Mutex::new(ProviderState {
                base_url: format!("http://{addr}"),
                ..Default::default()
            }));

            let app = Router::new()
                .route("/.well-known/openid-configuration", get(discovery))
                .route("/token", post(token))
                .route("/userinfo", get(user_info))
                .with_state(state.clone());
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
            FakeProvider { addr, state }
        }

        pub(crate) fn issuer(&self) -> String {
            format!("http://{}", self.addr)
        }

        /// Makes discovery report another issuer.
        pub(crate) fn set_issuer(&self, issuer: &str) {
            self.state.lock().unwrap().issuer = Some(issuer.to_string());
        }

        pub(crate) fn last_code_verifier(&self) -> Option<String> {
            self.state.lock().unwrap().last_code_verifier.clone()
        }
    }

    async fn discovery(State(state): State<Shared>) -> Json<Value> {
        let state = state.lock().unwrap();
        let base = &state.base_url;
        Json(json!({
            "issuer": state.issuer.clone().unwrap_or_else(|| format!("{base}/")),
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "userinfo_endpoint": format!("{base}/userinfo"),
            "jwks_uri": format!("{base}/jwks"),
            "end_session_endpoint": format!("{base}/logout"),
            "response_types_supported": ["code"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"],
        }))
    }

    async fn token(State(state): State<Shared>, body: String) -> Json<Value> {
        let form: std::collections::HashMap<String, String> =
            url::form_urlencoded::parse(body.as_bytes()).into_owned().collect();
        state.lock().unwrap().last_code_verifier = form.get("code_verifier").cloned();

        let mut response = json!({"access_token": ACCESS_TOKEN, "token_type": "Bearer"});
        if form.get("code").map(String::as_str) != Some("no-id-token") {
            response["id_token"] = "id-token".into();
        }
        Json(response)
    }

    async fn user_info(headers: HeaderMap) -> Result<Json<Value>, http::StatusCode> {
        let expected = format!("Bearer {ACCESS_TOKEN}");
        match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some(value) if value == expected => {
                Ok(Json(json!({"name": "Alice", "email": "alice@example.com"})))
            }
            _ => Err(http::StatusCode::UNAUTHORIZED),
        }
    }

    pub(crate) async fn sso(fake: &FakeCluster, dir: &Path) -> Sso {
        let pool = shared::db::open_memory_db().await.unwrap();
        Sso::new(pool, dir, fake.cluster.clone()).await.unwrap()
    }

    pub(crate) fn enabled_config(provider: &FakeProvider) -> SsoConfig {
        SsoConfig {
            enabled: true,
            client_id: "console".into(),
            client_secret: "secret".into(),
            discovery_url: provider.issuer(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_enable_requires_impersonation() {
        let fake = FakeCluster::spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::spawn().await;
        let sso = sso(&fake, dir.path()).await;

        assert!(matches!(
            sso.update_config(enabled_config(&provider)).await,
            Err(SsoError::BadConfig(_))
        ));

        sso.create_impersonation("root", "").await.unwrap();
        let config = sso.update_config(enabled_config(&provider)).await.unwrap();
        assert_eq!(config.token_url, format!("{}/token", provider.issuer()));
        assert_eq!(config.sign_out_url, format!("{}/logout", provider.issuer()));
        assert_eq!(sso.config().await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_create_then_replace() {
        let fake = FakeCluster::spawn().await;
        fake.sql.add_user("alice", "a", &[ROOT_GRANTS]);
        fake.sql.add_user("bob", "b", &[ROOT_GRANTS]);
        fake.sql.add_user("nobody", "n", &["GRANT USAGE ON *.* TO 'nobody'@'%'"]);
        let dir = tempfile::tempdir().unwrap();
        let sso = sso(&fake, dir.path()).await;

        sso.create_impersonation("alice", "a").await.unwrap();
        sso.create_impersonation("bob", "b").await.unwrap();
        let listed = sso.list_impersonations().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sql_user, "bob");

        // Rejected credentials leave the stored one in place
        let err = sso.create_impersonation("nobody", "n").await.unwrap_err();
        assert!(matches!(err, SsoError::InvalidImpersonateCredential(_)));
        let err = sso.create_impersonation("bob", "wrong").await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(sso.list_impersonations().await.unwrap()[0].sql_user, "bob");
    }

    #[tokio::test]
    async fn test_sign_in() {
        let fake = FakeCluster::spawn().await;
        fake.sql.add_user("svc", "pw", &[ROOT_GRANTS]);
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::spawn().await;
        let sso = sso(&fake, dir.path()).await;

        assert!(matches!(
            sso.sign_in("good", "verifier", "https://console/cb").await,
            Err(SsoError::Disabled)
        ));

        sso.create_impersonation("svc", "pw").await.unwrap();
        sso.update_config(enabled_config(&provider)).await.unwrap();

        let session = sso.sign_in("good", "verifier", "https://console/cb").await.unwrap();
        assert_eq!(session.display_name, "alice@example.com");
        assert_eq!(session.db_username, "svc");
        assert_eq!(session.db_password, "pw");
        assert_eq!(session.auth_from, AuthType::Sso);
        assert_eq!(session.oidc_id_token.as_deref(), Some("id-token"));
        assert!(session.is_writeable);
        assert_eq!(
            sso.list_impersonations().await.unwrap()[0].last_impersonate_status,
            Some(ImpersonateStatus::Success)
        );

        // A read only configuration downgrades the session
        let mut config = enabled_config(&provider);
        config.is_read_only = true;
        sso.update_config(config).await.unwrap();
        let session = sso.sign_in("good", "verifier", "https://console/cb").await.unwrap();
        assert!(!session.is_writeable);

        assert!(matches!(
            sso.sign_in("no-id-token", "verifier", "https://console/cb").await,
            Err(SsoError::OidcInternal(_))
        ));

        // The stored password stopped working
        fake.sql.add_user("svc", "rotated", &[ROOT_GRANTS]);
        assert!(matches!(
            sso.sign_in("good", "verifier", "https://console/cb").await,
            Err(SsoError::InvalidImpersonateCredential(_))
        ));
        assert_eq!(
            sso.list_impersonations().await.unwrap()[0].last_impersonate_status,
            Some(ImpersonateStatus::AuthFail)
        );
    }

    #[tokio::test]
    async fn test_auth_and_sign_out_urls() {
        let fake = FakeCluster::spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::spawn().await;
        let sso = sso(&fake, dir.path()).await;

        assert!(matches!(
            sso.auth_url("https://console/cb", "s", "v").await,
            Err(SsoError::Disabled)
        ));

        sso.create_impersonation("root", "").await.unwrap();
        sso.update_config(enabled_config(&provider)).await.unwrap();
        let url = sso.auth_url("https://console/cb", "s", "v").await.unwrap();
        assert!(url.starts_with(&format!("{}/authorize?", provider.issuer())));

        let url = sso.sign_out_url("id-token", "").await.unwrap();
        assert!(url.contains("id_token_hint=id-token"));
    }
}
