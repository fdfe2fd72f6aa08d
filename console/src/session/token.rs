//! Signed tokens with an encrypted payload.
//!
//! The serialized session is sealed under the process secret and carried in the `p`
//! claim of an HS256 token signed with the same secret. Only this process can read
//! the payload, and tokens minted under another secret do not verify.

use super::{SESSION_VERSION, Session, TokenResponse};
use crate::crypto::{self, CryptoError, KEY_LEN, Key};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::StatusCode;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::errors::ErrorClass;
use std::time::Duration;

pub const SESSION_SECRET_ENV: &str = "SESSION_SECRET";
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const REFRESH_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("could not sign token")]
    Encode(#[source] jsonwebtoken::errors::Error),
    #[error("invalid token")]
    Decode(#[source] jsonwebtoken::errors::Error),
    #[error("invalid token payload")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid token payload")]
    Crypto(#[from] CryptoError),
    #[error("invalid token payload")]
    Json(#[from] serde_json::Error),
    #[error("session version {0} is no longer supported")]
    VersionMismatch(String),
    #[error("session can no longer be refreshed")]
    RefreshExpired,
}

impl ErrorClass for TokenError {
    fn code(&self) -> &'static str {
        match self {
            TokenError::Encode(_) => "api.user.issue_token_failed",
            _ => "common.unauthenticated",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            TokenError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub p: String,
    pub exp: i64,
    pub iat: i64,
    /// Issue time of the first token in a refresh chain.
    pub orig_iat: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScopedClaims {
    sub: String,
    p: String,
    exp: i64,
}

pub struct SessionSigner {
    key: Key,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionSigner {
    pub fn new(key: Key) -> Self {
        SessionSigner {
            key,
            encoding: EncodingKey::from_secret(&key),
            decoding: DecodingKey::from_secret(&key),
        }
    }

    /// Takes the secret from `SESSION_SECRET` when it is exactly 32 bytes long,
    /// otherwise generates a fresh one.
    pub fn from_env() -> Self {
        let configured = std::env::var(SESSION_SECRET_ENV).ok();
        Self::new(secret_or_random(configured.as_deref()))
    }

    pub fn issue(&self, session: &Session) -> Result<TokenResponse, TokenError> {
        self.issue_with_origin(session, now_secs())
    }

    fn issue_with_origin(
        &self,
        session: &Session,
        orig_iat: i64,
    ) -> Result<TokenResponse, TokenError> {
        let now = now_secs();
        let claims = SessionClaims {
            p: self.seal(&serde_json::to_vec(session)?)?,
            exp: now + SESSION_TTL.as_secs() as i64,
            iat: now,
            orig_iat,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Encode)?;
        Ok(TokenResponse {
            token,
            expire_at: claims.exp,
        })
    }

    pub fn verify(&self, token: &str) -> Result<(Session, SessionClaims), TokenError> {
        let claims = jsonwebtoken::decode::<SessionClaims>(
            token,
            &self.decoding,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(TokenError::Decode)?
        .claims;

        let session: Session = serde_json::from_slice(&self.open(&claims.p)?)?;
        if session.version != SESSION_VERSION {
            return Err(TokenError::VersionMismatch(session.version));
        }
        Ok((session, claims))
    }

    /// Reissues a valid token while its refresh chain is younger than the horizon.
    pub fn refresh(&self, token: &str) -> Result<TokenResponse, TokenError> {
        let (session, claims) = self.verify(token)?;
        if now_secs() > claims.orig_iat + REFRESH_HORIZON.as_secs() as i64 {
            return Err(TokenError::RefreshExpired);
        }
        self.issue_with_origin(&session, claims.orig_iat)
    }

    /// Signs an opaque payload usable only under `context`.
    pub fn issue_scoped(
        &self,
        context: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let claims = ScopedClaims {
            sub: context.to_string(),
            p: self.seal(payload.as_bytes())?,
            exp: now_secs() + ttl.as_secs() as i64,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Encode)
    }

    pub fn verify_scoped(&self, context: &str, token: &str) -> Result<String, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.sub = Some(context.to_string());
        let claims = jsonwebtoken::decode::<ScopedClaims>(token, &self.decoding, &validation)
            .map_err(TokenError::Decode)?
            .claims;
        let payload = self.open(&claims.p)?;
        String::from_utf8(payload).map_err(|_| TokenError::Crypto(CryptoError::Decrypt))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String, TokenError> {
        Ok(STANDARD.encode(crypto::seal(&self.key, plaintext)?))
    }

    fn open(&self, encoded: &str) -> Result<Vec<u8>, TokenError> {
        Ok(crypto::open(&self.key, &STANDARD.decode(encoded)?)?)
    }
}

fn secret_or_random(configured: Option<&str>) -> Key {
    match configured {
        Some(secret) if secret.len() == KEY_LEN => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(secret.as_bytes());
            key
        }
        Some(secret) => {
            tracing::warn!(
                length = secret.len(),
                "{SESSION_SECRET_ENV} must be exactly {KEY_LEN} bytes, using a random secret"
            );
            crypto::random_key()
        }
        None => {
            tracing::info!("{SESSION_SECRET_ENV} is not set, sessions end with the process");
            crypto::random_key()
        }
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_key;

    fn session() -> Session {
        Session::with_db_auth("root", "hunter2", true)
    }

    #[test]
    fn test_issue_and_verify() {
        let signer = SessionSigner::new(random_key());
        let issued = signer.issue(&session()).unwrap();

        // The password never appears in the clear
        let payload = issued.token.split('.').nth(1).unwrap();
        assert!(!payload.contains("hunter2"));

        let (decoded, claims) = signer.verify(&issued.token).unwrap();
        assert_eq!(decoded, session());
        assert_eq!(claims.exp, issued.expire_at);
        assert_eq!(claims.orig_iat, claims.iat);
    }

    #[test]
    fn test_other_secret_rejected() {
        let issued = SessionSigner::new(random_key()).issue(&session()).unwrap();
        let other = SessionSigner::new(random_key());
        assert!(matches!(other.verify(&issued.token), Err(TokenError::Decode(_))));
        assert!(matches!(
            other.verify("not-a-token"),
            Err(TokenError::Decode(_))
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let signer = SessionSigner::new(random_key());
        let mut old = session();
        old.version = "v1".into();
        let issued = signer.issue(&old).unwrap();
        assert!(matches!(
            signer.verify(&issued.token),
            Err(TokenError::VersionMismatch(v)) if v == "v1"
        ));
    }

    #[test]
    fn test_refresh_keeps_origin() {
        let signer = SessionSigner::new(random_key());
        let first = signer.issue(&session()).unwrap();
        let (_, first_claims) = signer.verify(&first.token).unwrap();

        let refreshed = signer.refresh(&first.token).unwrap();
        let (decoded, claims) = signer.verify(&refreshed.token).unwrap();
        assert_eq!(decoded, session());
        assert_eq!(claims.orig_iat, first_claims.orig_iat);

        let stale = signer
            .issue_with_origin(&session(), now_secs() - 2 * REFRESH_HORIZON.as_secs() as i64)
            .unwrap();
        assert!(matches!(
            signer.refresh(&stale.token),
            Err(TokenError::RefreshExpired)
        ));
    }

    #[test]
    fn test_scoped_tokens() {
        let signer = SessionSigner::new(random_key());
        let token = signer
            .issue_scoped("logs/download", "1,2,3", Duration::from_secs(60))
            .unwrap();
        assert_eq!(signer.verify_scoped("logs/download", &token).unwrap(), "1,2,3");
        assert!(signer.verify_scoped("other", &token).is_err());
        // A scoped token is not a session
        assert!(signer.verify(&token).is_err());
    }

    #[test]
    fn test_secret_selection() {
        let exact = "0123456789abcdef0123456789abcdef";
        assert_eq!(secret_or_random(Some(exact)), *b"0123456789abcdef0123456789abcdef");
        assert_ne!(secret_or_random(Some("short")), secret_or_random(Some("short")));
        assert_ne!(secret_or_random(None), [0u8; KEY_LEN]);
    }
}
