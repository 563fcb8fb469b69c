//! In-process tool servers.
//!
//! A [`LocalToolServer`] holds async tool handlers and counts connections
//! and calls, which makes it the tool server of choice for tests and for
//! embedding native tools next to remote ones.

use async_trait::async_trait;
use chaincore::{ConnectionError, NodeError, ServerConfig, ToolClient, ToolConnector, ToolInfo, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>;
type ToolHandler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

struct LocalTool {
    info: ToolInfo,
    handler: ToolHandler,
}

pub struct LocalToolServer {
    id: String,
    tools: RwLock<HashMap<String, LocalTool>>,
    connects: AtomicUsize,
    calls: AtomicUsize,
    closes: AtomicUsize,
    /// Connect attempts that still have to fail
    failing_connects: AtomicUsize,
    /// Failed calls that precede a successful one, per tool
    failing_calls: RwLock<HashMap<String, usize>>,
    available: AtomicBool,
}

impl LocalToolServer {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tools: RwLock::new(HashMap::new()),
            connects: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            failing_calls: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register an async tool handler.
    pub fn register<F, Fut>(&self, name: &str, description: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let handler: ToolHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.tools.write().insert(
            name.to_string(),
            LocalTool {
                info: ToolInfo {
                    name: name.to_string(),
                    description: description.to_string(),
                    input_schema: serde_json::json!({"type": "object"}),
                },
                handler,
            },
        );
    }

    /// Register a synchronous tool handler.
    pub fn register_fn<F>(&self, name: &str, description: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, description, move |args| {
            let handler = handler.clone();
            async move { handler(args) }
        });
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls of `tool` fail with a tool error.
    pub fn fail_next_calls(&self, tool: &str, count: usize) {
        self.failing_calls.write().insert(tool.to_string(), count);
    }

    /// Refuse every connection while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn open(self: &Arc<Self>) -> Result<LocalClient, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || !self.available.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectFailed {
                server_id: self.id.clone(),
                message: "connection refused".to_string(),
            });
        }
        debug!("Opened local connection to {}", self.id);
        Ok(LocalClient {
            server: self.clone(),
            open: AtomicBool::new(true),
        })
    }

    fn take_injected_failure(&self, tool: &str) -> bool {
        let mut failing = self.failing_calls.write();
        match failing.get_mut(tool) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Connection to a [`LocalToolServer`]
pub struct LocalClient {
    server: Arc<LocalToolServer>,
    open: AtomicBool,
}

#[async_trait]
impl ToolClient for LocalClient {
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<Value, NodeError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport("connection closed".to_string()).into());
        }
        self.server.calls.fetch_add(1, Ordering::SeqCst);

        if self.server.take_injected_failure(name) {
            return Err(NodeError::ToolCall {
                tool: name.to_string(),
                message: "injected failure".to_string(),
            });
        }

        let handler = self
            .server
            .tools
            .read()
            .get(name)
            .map(|tool| tool.handler.clone())
            .ok_or_else(|| NodeError::ToolCall {
                tool: name.to_string(),
                message: format!("unknown tool on server {}", self.server.id),
            })?;

        handler(arguments)
            .await
            .map(Value::from_json)
            .map_err(|message| NodeError::ToolCall {
                tool: name.to_string(),
                message,
            })
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ConnectionError> {
        let mut tools: Vec<ToolInfo> = self
            .server
            .tools
            .read()
            .values()
            .map(|t| t.info.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    fn is_healthy(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.server.available.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.server.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Connector resolving server ids to in-process tool servers
#[derive(Default)]
pub struct LocalConnector {
    servers: RwLock<HashMap<String, Arc<LocalToolServer>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: Arc<LocalToolServer>) {
        self.servers.write().insert(server.id().to_string(), server);
    }

    pub fn server(&self, id: &str) -> Option<Arc<LocalToolServer>> {
        self.servers.read().get(id).cloned()
    }
}

#[async_trait]
impl ToolConnector for LocalConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn ToolClient>, ConnectionError> {
        let local = self
            .server(&server.id)
            .ok_or_else(|| ConnectionError::UnknownServer(server.id.clone()))?;
        Ok(Arc::new(local.open()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn math_server() -> Arc<LocalToolServer> {
        let server = LocalToolServer::new("math");
        server.register_fn("add", "Add two numbers", |args| {
            let a = args["a"].as_f64().ok_or("missing a")?;
            let b = args["b"].as_f64().ok_or("missing b")?;
            Ok(serde_json::json!(a + b))
        });
        server
    }

    #[tokio::test]
    async fn test_call_registered_tool() {
        let connector = LocalConnector::new();
        connector.register(math_server());

        let client = connector.connect(&ServerConfig::local("math")).await.unwrap();
        let sum = client
            .call_tool("add", serde_json::json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(sum, Value::Number(5.0));

        let err = client
            .call_tool("add", serde_json::json!({"a": 2}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NodeError::ToolCall {
                tool: "add".to_string(),
                message: "missing b".to_string()
            }
        );
        assert_eq!(client.list_tools().await.unwrap()[0].name, "add");
    }

    #[tokio::test]
    async fn test_failure_injection_and_close() {
        let server = math_server();
        let connector = LocalConnector::new();
        connector.register(server.clone());
        let config = ServerConfig::local("math");

        server.fail_next_connects(1);
        assert!(connector.connect(&config).await.is_err());
        let client = connector.connect(&config).await.unwrap();
        assert_eq!(server.connect_count(), 2);

        server.fail_next_calls("add", 1);
        assert!(client.call_tool("add", serde_json::json!({"a": 1, "b": 1})).await.is_err());
        assert!(client.call_tool("add", serde_json::json!({"a": 1, "b": 1})).await.is_ok());

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_healthy());
        assert_eq!(server.close_count(), 1);
        assert!(matches!(
            client.call_tool("add", serde_json::json!({})).await,
            Err(NodeError::Connection(_))
        ));

        assert!(matches!(
            connector.connect(&ServerConfig::local("nowhere")).await,
            Err(ConnectionError::UnknownServer(_))
        ));
    }
}
