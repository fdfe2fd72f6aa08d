use super::SsoError;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sso_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value TEXT NOT NULL
);
"#;

/// Single sign-on settings. The endpoint URLs are filled in by discovery when
/// the configuration is enabled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsoConfig {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    pub discovery_url: String,
    /// Space separated scopes requested on top of `openid profile email`.
    pub scopes: String,
    pub is_read_only: bool,
    pub auth_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub sign_out_url: String,
}

pub struct SsoConfigStore {
    pool: SqlitePool,
}

impl SsoConfigStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, SsoError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(SsoConfigStore { pool })
    }

    /// The stored configuration, or the disabled default.
    pub async fn load(&self) -> Result<SsoConfig, SsoError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sso_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((value,)) => Ok(serde_json::from_str(&value)?),
            None => Ok(SsoConfig::default()),
        }
    }

    pub async fn save(&self, config: &SsoConfig) -> Result<(), SsoError> {
        sqlx::query(
            "INSERT INTO sso_config (id, value) VALUES (1, ?)
             ON CONFLICT (id) DO UPDATE SET value = excluded.value",
        )
        .bind(serde_json::to_string(config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
