//! OpenID Connect client: discovery, PKCE authorization URLs, code exchange and
//! user info.

use super::SsoError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::header::CONTENT_TYPE;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

pub const OIDC_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCOPES: [&str; 3] = ["openid", "profile", "email"];
const WELL_KNOWN_PATH: &str = ".well-known/openid-configuration";

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: String,
    #[serde(default)]
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: String,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub subject_types_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl ProviderMetadata {
    fn missing_field(&self) -> Option<&'static str> {
        let required = [
            ("token_endpoint", self.token_endpoint.is_empty()),
            ("authorization_endpoint", self.authorization_endpoint.is_empty()),
            ("userinfo_endpoint", self.userinfo_endpoint.is_empty()),
            ("jwks_uri", self.jwks_uri.is_empty()),
            ("response_types_supported", self.response_types_supported.is_empty()),
            ("subject_types_supported", self.subject_types_supported.is_empty()),
            (
                "id_token_signing_alg_values_supported",
                self.id_token_signing_alg_values_supported.is_empty(),
            ),
        ];
        required
            .into_iter()
            .find_map(|(name, missing)| missing.then_some(name))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Tokens obtained for an authorization code.
#[derive(Debug)]
pub struct Exchanged {
    pub access_token: String,
    pub id_token: String,
}

/// Trims the trailing slash and defaults the scheme to https.
pub fn normalize_issuer(raw: &str) -> Result<String, SsoError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let issuer = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&issuer).map_err(|e| SsoError::DiscoverFailed(format!("invalid issuer url: {e}")))?;
    Ok(issuer)
}

/// Fetches and validates the provider metadata of `issuer`.
pub async fn discover(client: &reqwest::Client, issuer: &str) -> Result<ProviderMetadata, SsoError> {
    let issuer = normalize_issuer(issuer)?;
    let url = format!("{issuer}/{WELL_KNOWN_PATH}");

    let response = client
        .get(&url)
        .timeout(OIDC_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SsoError::DiscoverFailed(format!("could not fetch {url}: {e}")))?;
    let metadata: ProviderMetadata = response
        .json()
        .await
        .map_err(|e| SsoError::DiscoverFailed(format!("invalid provider metadata: {e}")))?;

    if metadata.issuer.trim_end_matches('/') != issuer {
        return Err(SsoError::DiscoverFailed(format!(
            "issuer mismatch, expected {issuer} got {}",
            metadata.issuer
        )));
    }
    if let Some(field) = metadata.missing_field() {
        return Err(SsoError::DiscoverFailed(format!(
            "provider metadata is missing {field}"
        )));
    }
    Ok(metadata)
}

/// `base64url(sha256(verifier))` without padding.
pub fn code_challenge(code_verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()))
}

/// The default scopes followed by the configured ones, without duplicates.
pub fn scopes(extra: &str) -> Vec<String> {
    let mut scopes: Vec<String> = DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();
    for scope in extra.split_whitespace() {
        if !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
    }
    scopes
}

pub struct AuthRequest<'a> {
    pub auth_url: &'a str,
    pub client_id: &'a str,
    pub redirect_url: &'a str,
    pub scopes: &'a str,
    pub state: &'a str,
    pub code_verifier: &'a str,
}

pub fn auth_url(request: &AuthRequest<'_>) -> Result<String, SsoError> {
    let mut url = Url::parse(request.auth_url)
        .map_err(|e| SsoError::BadConfig(format!("invalid auth url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", request.client_id)
        .append_pair("redirect_uri", request.redirect_url)
        .append_pair("scope", &scopes(request.scopes).join(" "))
        .append_pair("state", request.state)
        .append_pair("code_challenge", &code_challenge(request.code_verifier))
        .append_pair("code_challenge_method", "S256");
    Ok(url.into())
}

pub struct CodeExchange<'a> {
    pub token_url: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub redirect_url: &'a str,
    pub code: &'a str,
    pub code_verifier: &'a str,
}

pub async fn exchange(
    client: &reqwest::Client,
    request: &CodeExchange<'_>,
) -> Result<Exchanged, SsoError> {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", "authorization_code")
        .append_pair("code", request.code)
        .append_pair("redirect_uri", request.redirect_url)
        .append_pair("client_id", request.client_id)
        .append_pair("client_secret", request.client_secret)
        .append_pair("code_verifier", request.code_verifier)
        .finish();

    let response: TokenResponse = client
        .post(request.token_url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .timeout(OIDC_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SsoError::OidcInternal(format!("code exchange failed: {e}")))?
        .json()
        .await
        .map_err(|e| SsoError::OidcInternal(format!("invalid token response: {e}")))?;

    let id_token = response
        .id_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SsoError::OidcInternal("token response has no id_token".into()))?;
    Ok(Exchanged {
        access_token: response.access_token,
        id_token,
    })
}

pub async fn user_info(
    client: &reqwest::Client,
    user_info_url: &str,
    access_token: &str,
) -> Result<UserInfo, SsoError> {
    client
        .get(user_info_url)
        .bearer_auth(access_token)
        .timeout(OIDC_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SsoError::OidcInternal(format!("user info request failed: {e}")))?
        .json()
        .await
        .map_err(|e| SsoError::OidcInternal(format!("invalid user info: {e}")))
}

/// The provider's end-session URL for the given id token.
pub fn sign_out_url(
    sign_out_url: &str,
    client_id: &str,
    id_token: &str,
    redirect_url: &str,
) -> Result<String, SsoError> {
    let mut url = Url::parse(sign_out_url)
        .map_err(|e| SsoError::BadConfig(format!("invalid sign out url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", client_id)
            .append_pair("id_token_hint", id_token);
        if !redirect_url.is_empty() {
            query.append_pair("post_logout_redirect_uri", redirect_url);
        }
    }
    Ok(url.into())
}
