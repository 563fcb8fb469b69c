use crate::{ConnectionError, NodeError, ServerConfig, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tool advertised by a tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// An open connection to a tool server.
///
/// Implementations must be safe to share between tasks; the pool hands the
/// same client to one borrower at a time but may close it from the reaper.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Invoke a named tool. Transport failures are reported as
    /// `NodeError::Connection`, tool-level failures as `NodeError::ToolCall`.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<Value, NodeError>;

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ConnectionError>;

    /// False once the connection is known to be broken.
    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Opens connections for a server configuration.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn ToolClient>, ConnectionError>;
}
