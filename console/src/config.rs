use serde::Deserialize;
use shared::http::{Listener, ListenerError};
use std::path::PathBuf;
use topology::config::ClusterConfig;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("invalid listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("invalid cluster config: {0}")]
    Cluster(#[from] topology::config::ValidationError),
    #[error("api prefix must start with '/' and must not end with '/': {0:?}")]
    InvalidApiPrefix(String),
    #[error("data_dir cannot be empty")]
    EmptyDataDir,
    #[error("temp_dir cannot be empty")]
    EmptyTempDir,
}

fn default_listener() -> Listener {
    Listener::new("127.0.0.1", 12333)
}

fn default_admin_listener() -> Listener {
    Listener::new("127.0.0.1", 12334)
}

fn default_api_prefix() -> String {
    "/dashboard/api".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConsoleConfig {
    /// Serves the API.
    #[serde(default = "default_listener")]
    pub listener: Listener,
    /// Serves `/health` and `/ready`.
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    pub cluster: ClusterConfig,
    /// Holds the local database and the impersonation key.
    pub data_dir: PathBuf,
    /// Scratch space for log bundles.
    pub temp_dir: PathBuf,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl ConsoleConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.cluster.validate()?;

        let prefix = &self.api_prefix;
        if !prefix.starts_with('/') || (prefix.len() > 1 && prefix.ends_with('/')) {
            return Err(ValidationError::InvalidApiPrefix(prefix.clone()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ValidationError::EmptyDataDir);
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(ValidationError::EmptyTempDir);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(coordinator_url: &str) -> Self {
        ConsoleConfig {
            listener: default_listener(),
            admin_listener: default_admin_listener(),
            cluster: ClusterConfig::new(coordinator_url),
            data_dir: PathBuf::from("data"),
            temp_dir: PathBuf::from("tmp"),
            api_prefix: default_api_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let config = ConsoleConfig::for_tests("http://127.0.0.1:2379");
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.api_prefix = "dashboard/api".into();
        assert!(matches!(
            bad.validate(),
            Err(ValidationError::InvalidApiPrefix(_))
        ));

        let mut bad = config.clone();
        bad.listener.port = 0;
        assert_eq!(
            bad.validate(),
            Err(ValidationError::Listener(ListenerError::InvalidPort))
        );

        let mut bad = config;
        bad.data_dir = PathBuf::new();
        assert_eq!(bad.validate(), Err(ValidationError::EmptyDataDir));
    }

    #[test]
    fn test_defaults() {
        let config: ConsoleConfig = serde_yaml::from_str(
            r#"
            cluster:
                coordinator_url: http://127.0.0.1:2379
            data_dir: /var/lib/console
            temp_dir: /tmp/console
            "#,
        )
        .unwrap();
        assert_eq!(config.listener, Listener::new("127.0.0.1", 12333));
        assert_eq!(config.admin_listener.port, 12334);
        assert_eq!(config.api_prefix, "/dashboard/api");
        assert_eq!(config.cluster.request_timeout_secs, 10);
    }
}
