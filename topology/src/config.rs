use crate::sql::SqlEndpoint;
use serde::Deserialize;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("coordinator url is empty")]
    EmptyCoordinatorUrl,
    #[error("invalid coordinator url: {0}")]
    InvalidCoordinatorUrl(String),
    #[error("request timeout cannot be 0")]
    InvalidTimeout,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Base URL of the coordinator, e.g. `http://127.0.0.1:2379`.
    pub coordinator_url: String,
    /// SQL endpoint to use instead of picking a node from the registry.
    #[serde(default)]
    pub sql_endpoint: Option<SqlEndpoint>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl ClusterConfig {
    pub fn new<U: Into<String>>(coordinator_url: U) -> Self {
        ClusterConfig {
            coordinator_url: coordinator_url.into(),
            sql_endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.coordinator_url.is_empty() {
            return Err(ValidationError::EmptyCoordinatorUrl);
        }
        url::Url::parse(&self.coordinator_url)
            .map_err(|e| ValidationError::InvalidCoordinatorUrl(e.to_string()))?;
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ClusterConfig::new("http://127.0.0.1:2379").validate().is_ok());
        assert_eq!(
            ClusterConfig::new("").validate(),
            Err(ValidationError::EmptyCoordinatorUrl)
        );
        assert!(matches!(
            ClusterConfig::new("127.0.0.1:2379 x").validate(),
            Err(ValidationError::InvalidCoordinatorUrl(_))
        ));

        let mut config = ClusterConfig::new("http://127.0.0.1:2379");
        config.request_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidTimeout));
    }
}
