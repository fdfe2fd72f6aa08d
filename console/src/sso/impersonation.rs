//! The database credential SSO users act as.
//!
//! The password is sealed with a master key kept next to the database in
//! `dbek.bin`. The key file is created on first use and is readable by the owner only.

use super::SsoError;
use crate::crypto::{self, KEY_LEN, Key};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const MASTER_KEY_FILENAME: &str = "dbek.bin";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sso_impersonation (
    sql_user TEXT PRIMARY KEY NOT NULL,
    encrypted_pass TEXT NOT NULL,
    last_impersonate_status TEXT
);
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpersonateStatus {
    Success,
    AuthFail,
    InsufficientPriv,
}

impl ImpersonateStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ImpersonateStatus::Success => "success",
            ImpersonateStatus::AuthFail => "auth_fail",
            ImpersonateStatus::InsufficientPriv => "insufficient_priv",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(ImpersonateStatus::Success),
            "auth_fail" => Some(ImpersonateStatus::AuthFail),
            "insufficient_priv" => Some(ImpersonateStatus::InsufficientPriv),
            _ => None,
        }
    }
}

/// What operators see of an impersonation. The password is never listed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Impersonation {
    pub sql_user: String,
    pub last_impersonate_status: Option<ImpersonateStatus>,
}

/// Lazily created master key file.
pub struct MasterKey {
    path: PathBuf,
    key: Mutex<Option<Key>>,
}

impl MasterKey {
    pub fn new(data_dir: &Path) -> Self {
        MasterKey {
            path: data_dir.join(MASTER_KEY_FILENAME),
            key: Mutex::new(None),
        }
    }

    pub async fn get_or_create(&self) -> Result<Key, SsoError> {
        let mut cached = self.key.lock().await;
        if let Some(key) = *cached {
            return Ok(key);
        }

        let key = match tokio::fs::read(&self.path).await {
            Ok(bytes) => Key::try_from(bytes.as_slice()).map_err(|_| {
                SsoError::MasterKey(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "{} must hold exactly {KEY_LEN} bytes, found {}",
                        self.path.display(),
                        bytes.len()
                    ),
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = crypto::random_key();
                self.write_new(&key).await.map_err(SsoError::MasterKey)?;
                tracing::info!(path = %self.path.display(), "created impersonation master key");
                key
            }
            Err(e) => return Err(SsoError::MasterKey(e)),
        };
        *cached = Some(key);
        Ok(key)
    }

    async fn write_new(&self, key: &Key) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o400);
        let mut file = options.open(&self.path).await?;
        file.write_all(key).await?;
        file.sync_all().await
    }
}

pub struct ImpersonationStore {
    pool: SqlitePool,
    master_key: MasterKey,
    create_lock: Mutex<()>,
}

impl ImpersonationStore {
    pub async fn new(pool: SqlitePool, data_dir: &Path) -> Result<Self, SsoError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(ImpersonationStore {
            pool,
            master_key: MasterKey::new(data_dir),
            create_lock: Mutex::new(()),
        })
    }

    /// Replaces any stored impersonation. The caller verifies the credential first.
    pub async fn create(&self, sql_user: &str, password: &str) -> Result<(), SsoError> {
        let key = self.master_key.get_or_create().await?;
        let sealed = hex::encode(crypto::seal(&key, password.as_bytes())?);

        let _guard = self.create_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sso_impersonation")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO sso_impersonation (sql_user, encrypted_pass) VALUES (?, ?)")
            .bind(sql_user)
            .bind(sealed)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Impersonation>, SsoError> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT sql_user, last_impersonate_status FROM sso_impersonation ORDER BY sql_user",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(sql_user, status)| Impersonation {
                sql_user,
                last_impersonate_status: status.as_deref().and_then(ImpersonateStatus::parse),
            })
            .collect())
    }

    /// The stored user and its decrypted password.
    pub async fn credential(&self) -> Result<Option<(String, String)>, SsoError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT sql_user, encrypted_pass FROM sso_impersonation LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        let Some((sql_user, sealed)) = row else {
            return Ok(None);
        };

        let key = self.master_key.get_or_create().await?;
        let sealed = hex::decode(sealed).map_err(|_| SsoError::CorruptImpersonation)?;
        let password = String::from_utf8(crypto::open(&key, &sealed)?)
            .map_err(|_| SsoError::CorruptImpersonation)?;
        Ok(Some((sql_user, password)))
    }

    pub async fn set_status(&self, sql_user: &str, status: ImpersonateStatus) -> Result<(), SsoError> {
        sqlx::query("UPDATE sso_impersonation SET last_impersonate_status = ? WHERE sql_user = ?")
            .bind(status.as_str())
            .bind(sql_user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn exists(&self) -> Result<bool, SsoError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sso_impersonation")
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}
