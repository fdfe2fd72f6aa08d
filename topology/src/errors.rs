#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("could not decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("malformed registry entry {key}: {detail}")]
    MalformedEntry { key: String, detail: String },
}
