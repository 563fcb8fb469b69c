use crate::http::HttpToolClient;
use crate::local::{LocalConnector, LocalToolServer};
use crate::stdio::StdioToolClient;
use async_trait::async_trait;
use chaincore::{ConnectionError, ServerConfig, ToolClient, ToolConnector, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector that opens a client for whichever transport a server declares
pub struct TransportConnector {
    local: LocalConnector,
    request_timeout: Duration,
}

impl TransportConnector {
    pub fn new() -> Self {
        Self {
            local: LocalConnector::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Per-request timeout applied to HTTP servers
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Serve `Transport::Local` servers with this id from `server`.
    pub fn with_local(self, server: Arc<LocalToolServer>) -> Self {
        self.local.register(server);
        self
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolConnector for TransportConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn ToolClient>, ConnectionError> {
        match &server.transport {
            Transport::Stdio { command, args, env } => {
                info!("Spawning tool server {}: {}", server.id, command);
                let client = StdioToolClient::spawn(&server.id, command, args, env).await?;
                Ok(Arc::new(client))
            }
            Transport::Http { url, headers } => {
                info!("Connecting to tool server {} at {}", server.id, url);
                let client =
                    HttpToolClient::connect(&server.id, url, headers, self.request_timeout).await?;
                Ok(Arc::new(client))
            }
            Transport::Local => self.local.connect(server).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_transport_is_routed() {
        let server = LocalToolServer::new("echo");
        server.register_fn("echo", "Echo the arguments", Ok);
        let connector = TransportConnector::new().with_local(server.clone());

        let client = connector.connect(&ServerConfig::local("echo")).await.unwrap();
        assert!(client.is_healthy());
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_stdio_spawn_failure_is_a_connect_error() {
        let connector = TransportConnector::new();
        let config = ServerConfig::stdio("ghost", "/nonexistent/tool-server-binary", vec![]);

        match connector.connect(&config).await {
            Err(ConnectionError::ConnectFailed { server_id, .. }) => assert_eq!(server_id, "ghost"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_http_server_is_a_connect_error() {
        let connector = TransportConnector::new().with_request_timeout(Duration::from_millis(500));
        let config = ServerConfig::http("offline", "http://127.0.0.1:9/mcp");

        assert!(matches!(
            connector.connect(&config).await,
            Err(ConnectionError::ConnectFailed { .. })
        ));
    }
}
