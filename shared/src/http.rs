use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ListenerError {
    #[error("port cannot be 0")]
    InvalidPort,
    #[error("host cannot be empty")]
    EmptyHost,
}

impl Listener {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Listener {
            host: host.into(),
            port,
        }
    }

    pub fn validate(&self) -> Result<(), ListenerError> {
        if self.host.is_empty() {
            return Err(ListenerError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ListenerError::InvalidPort);
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Binds the listener and serves the router until the process exits.
pub async fn run_http_service(listener: &Listener, router: Router) -> std::io::Result<()> {
    let tcp = TcpListener::bind(listener.addr()).await?;
    tracing::info!(addr = %listener.addr(), "listening");
    axum::serve(tcp, router).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_validate() {
        assert!(Listener::new("127.0.0.1", 12333).validate().is_ok());
        assert_eq!(
            Listener::new("127.0.0.1", 0).validate(),
            Err(ListenerError::InvalidPort)
        );
        assert_eq!(
            Listener::new("", 80).validate(),
            Err(ListenerError::EmptyHost)
        );
        assert_eq!(Listener::new("0.0.0.0", 80).addr(), "0.0.0.0:80");
    }
}
