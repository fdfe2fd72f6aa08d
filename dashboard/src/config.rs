use console::config::ConsoleConfig;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

fn default_level() -> String {
    "info".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `info,console=debug`. `RUST_LOG` wins.
    #[serde(default = "default_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            sentry_dsn: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(flatten)]
    pub console: ConsoleConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.console.validate()?;
        if let Some(logging) = &self.common.logging {
            EnvFilter::try_new(&logging.level)
                .map_err(|e| ConfigError::InvalidLogLevel(logging.level.clone(), e.to_string()))?;
        }
        if let Some(metrics) = &self.common.metrics {
            if metrics.statsd_host.is_empty() || metrics.statsd_port == 0 {
                return Err(ConfigError::InvalidMetrics);
            }
        }
        Ok(())
    }

    pub fn logging(&self) -> LoggingConfig {
        self.common.logging.clone().unwrap_or_default()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(#[from] console::config::ValidationError),
    #[error("invalid log level {0:?}: {1}")]
    InvalidLogLevel(String, String),
    #[error("statsd host and port must be set")]
    InvalidMetrics,
}
