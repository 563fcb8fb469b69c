//! Core abstractions for the tool-chaining workflow engine
//!
//! This crate provides the data model (workflows, nodes, executions), the
//! error taxonomy, the tool-server seam traits, the execution monitor and
//! the audit trail reconstructor. It has no scheduling logic.

pub mod audit;
mod client;
mod error;
pub mod events;
mod execution;
mod node;
mod value;
mod workflow;

pub use audit::{
    filter_events, reconstruct_audit_trail, AuditCounts, AuditEvent, AuditEventType, AuditFilter,
    AuditTrail,
};
pub use client::{ToolClient, ToolConnector, ToolInfo};
pub use error::{CacheError, ConnectionError, ErrorKind, FlowError, NodeError, WorkflowError};
pub use events::*;
pub use execution::{
    Execution, ExecutionError, ExecutionId, ExecutionStatus, NodeExecution, NodeStatus,
    RetryAttempt,
};
pub use node::{NodeId, NodeKind, NodeSpec, NodeType};
pub use value::Value;
pub use workflow::{Edge, ServerConfig, Transport, VariableDecl, Workflow, WorkflowId};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
