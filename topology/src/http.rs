use crate::errors::ClusterError;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not build http client with timeout, using defaults");
            Client::new()
        })
}

/// Sends the request and returns the body of a successful response.
pub(crate) async fn send(request: RequestBuilder, url: &str) -> Result<String, ClusterError> {
    let response = request.send().await.map_err(|source| ClusterError::Request {
        url: url.to_string(),
        source,
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|source| ClusterError::Request {
        url: url.to_string(),
        source,
    })?;

    if !status.is_success() {
        return Err(ClusterError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }

    Ok(body)
}

pub(crate) async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    url: &str,
) -> Result<T, ClusterError> {
    let body = send(request, url).await?;
    serde_json::from_str(&body).map_err(|source| ClusterError::Decode {
        url: url.to_string(),
        source,
    })
}
