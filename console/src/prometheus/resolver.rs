//! Address of the metrics server the console queries.
//!
//! An operator override stored in the coordinator config wins over the server
//! found in the deployment registry. Lookups are cached for [`CACHE_TTL`] and
//! concurrent misses share a single lookup.

use super::PromError;
use crate::flatten::flatten;
use crate::metrics_defs::PROM_ADDRESS_FETCHES;
use moka::future::Cache;
use serde::Serialize;
use serde_json::{Value, json};
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use topology::coordinator::CoordinatorClient;
use topology::registry::DeploymentRegistry;
use url::Url;

pub const CACHE_TTL: Duration = Duration::from_secs(5);
const CUSTOM_ADDRESS_KEY: &str = "pd-server.metric-storage";

/// Adds `http://` when no scheme is given and drops trailing slashes.
pub fn normalize_address(raw: &str) -> Result<String, PromError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let invalid = || PromError::InvalidAddress(raw.to_string());

    let url = Url::parse(&with_scheme).map_err(|_| invalid())?;
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

    let mut normalized = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{port}"));
    }
    normalized.push_str(url.path().trim_end_matches('/'));
    Ok(normalized)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PromAddresses {
    /// The override as stored, even when it does not parse.
    pub customized_addr: String,
    pub deployed_addr: String,
}

#[derive(Clone)]
pub struct PromResolver {
    coordinator: CoordinatorClient,
    registry: Arc<dyn DeploymentRegistry>,
    cache: Cache<(), String>,
}

impl PromResolver {
    pub fn new(coordinator: CoordinatorClient, registry: Arc<dyn DeploymentRegistry>) -> Self {
        PromResolver {
            coordinator,
            registry,
            cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    /// The active address, or an empty string when there is none.
    pub async fn resolve(&self) -> Result<String, PromError> {
        self.cache
            .try_get_with((), self.resolve_uncached())
            .await
            .map_err(PromError::Shared)
    }

    async fn resolve_uncached(&self) -> Result<String, PromError> {
        counter!(PROM_ADDRESS_FETCHES).increment(1);

        let custom = self.customized().await?;
        if !custom.is_empty() {
            return normalize_address(&custom);
        }
        self.deployed().await
    }

    async fn customized(&self) -> Result<String, PromError> {
        let config = self
            .coordinator
            .get_config()
            .await
            .map_err(PromError::LoadAddressFailed)?;
        Ok(match flatten(&config).remove(CUSTOM_ADDRESS_KEY) {
            Some(Value::String(addr)) => addr,
            _ => String::new(),
        })
    }

    async fn deployed(&self) -> Result<String, PromError> {
        let info = self
            .registry
            .get_prometheus()
            .await
            .map_err(PromError::LoadAddressFailed)?;
        Ok(info.map(|i| i.url()).unwrap_or_default())
    }

    /// Both candidate addresses, for display. The override is not validated.
    pub async fn addresses(&self) -> Result<PromAddresses, PromError> {
        Ok(PromAddresses {
            customized_addr: self.customized().await?,
            deployed_addr: self.deployed().await?,
        })
    }

    /// Stores an override in the coordinator. An empty address removes it.
    pub async fn set_custom(&self, addr: &str) -> Result<String, PromError> {
        let normalized = if addr.trim().is_empty() {
            String::new()
        } else {
            normalize_address(addr)?
        };
        self.coordinator
            .set_config(&json!({"metric-storage": normalized}))
            .await
            .map_err(PromError::SaveAddressFailed)?;
        self.cache.invalidate(&()).await;
        tracing::info!(addr = %normalized, "updated metrics server override");
        Ok(normalized)
    }
}
