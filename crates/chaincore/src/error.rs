use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Engine is closed")]
    EngineClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Validation failures. Always raised before any node runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Workflow must have exactly one start node, found {0}")]
    StartNode(usize),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Node '{0}' is not reachable from the start node")]
    Unreachable(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Unknown server '{server_id}' referenced by node '{node_id}'")]
    UnknownServer { node_id: String, server_id: String },

    #[error("Missing required variable: {0}")]
    MissingVariable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolCall { tool: String, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    /// Transient failures worth another attempt. Expression and configuration
    /// failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::ToolCall { .. } | NodeError::Connection(_) | NodeError::Timeout { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Connection(_) => ErrorKind::Connection,
            NodeError::Cancelled => ErrorKind::Cancellation,
            _ => ErrorKind::NodeExecution,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Failed to connect to server '{server_id}': {message}")]
    ConnectFailed { server_id: String, message: String },

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Timed out waiting for a connection to '{0}'")]
    AcquireTimeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Cancelled while acquiring a connection")]
    Cancelled,
}

/// Cache faults never fail a run; callers log them and recompute.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache is disabled")]
    Disabled,

    #[error("Entry weight {weight} exceeds cache capacity {capacity}")]
    TooLarge { weight: usize, capacity: usize },

    #[error("Failed to weigh entry: {0}")]
    Weigh(String),
}

/// Error category recorded on `Execution` and `NodeExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NodeExecution,
    Connection,
    Cache,
    Cancellation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NodeExecution => "node_execution",
            ErrorKind::Connection => "connection",
            ErrorKind::Cache => "cache",
            ErrorKind::Cancellation => "cancellation",
        };
        f.write_str(name)
    }
}
