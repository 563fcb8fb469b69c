use crate::{ErrorKind, NodeError, NodeId, NodeType, Value, Workflow, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub type ExecutionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Error recorded on an execution or a node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
            context: BTreeMap::new(),
        }
    }

    /// Record of a node error whose retries ran out. Connection faults
    /// surface as node execution errors with the pool-level kind kept under
    /// the `cause` context key.
    pub fn from_node_error(node_id: &str, error: &NodeError) -> Self {
        match error.kind() {
            ErrorKind::Connection => Self::new(ErrorKind::NodeExecution, error.to_string())
                .for_node(node_id)
                .with_context("cause", ErrorKind::Connection.to_string()),
            kind => Self::new(kind, error.to_string()).for_node(node_id),
        }
    }

    pub fn for_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A failed attempt that was followed by another one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

/// Per-node record inside an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub retry_count: u32,
    #[serde(default)]
    pub retries: Vec<RetryAttempt>,
    /// Set when the outputs were served from the execution cache
    #[serde(default)]
    pub cached: bool,
    pub error: Option<ExecutionError>,
}

impl NodeExecution {
    pub fn new(node_id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            node_type,
            status: NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            retry_count: 0,
            retries: Vec::new(),
            cached: false,
            error: None,
        }
    }

    pub fn start(&mut self, inputs: HashMap<String, Value>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = NodeStatus::Running;
        self.started_at = Some(Utc::now());
        self.inputs = inputs;
    }

    pub fn record_retry(&mut self, attempt: u32, failed_at: DateTime<Utc>, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.retry_count += 1;
        self.retries.push(RetryAttempt {
            attempt,
            failed_at,
            error: error.into(),
        });
    }

    pub fn complete(&mut self, outputs: HashMap<String, Value>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = NodeStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.outputs = outputs;
    }

    pub fn fail(&mut self, error: ExecutionError) {
        if self.status.is_terminal() {
            return;
        }
        self.status = NodeStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Mark the node skipped. `reason` is kept as a cancellation error when
    /// the node was interrupted mid-flight.
    pub fn skip(&mut self, reason: Option<ExecutionError>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(Utc::now());
        self.error = reason;
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// One concrete run of a workflow.
///
/// Mutated only by the engine. Once `completed_at` is set every transition
/// method becomes a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Variable values supplied when the run started
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub node_executions: Vec<NodeExecution>,
    pub error: Option<ExecutionError>,
    pub return_value: Option<Value>,
}

impl Execution {
    pub fn new(workflow: &Workflow, context: HashMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version.clone(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            inputs: context.clone(),
            context,
            node_executions: Vec::new(),
            error: None,
            return_value: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn start(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Running;
        self.started_at = Utc::now();
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        if self.is_terminal() {
            return;
        }
        self.context.insert(name.into(), value);
    }

    pub fn set_return_value(&mut self, value: Value) {
        if self.is_terminal() {
            return;
        }
        self.return_value = Some(value);
    }

    /// Append a node record and return its index.
    pub fn push_node(&mut self, node: NodeExecution) -> Option<usize> {
        if self.is_terminal() {
            return None;
        }
        self.node_executions.push(node);
        Some(self.node_executions.len() - 1)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut NodeExecution> {
        if self.is_terminal() {
            return None;
        }
        self.node_executions.get_mut(index)
    }

    pub fn node_execution(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions.iter().find(|n| n.node_id == node_id)
    }

    pub fn complete(&mut self) {
        self.finish(ExecutionStatus::Completed, None);
    }

    pub fn fail(&mut self, error: ExecutionError) {
        self.finish(ExecutionStatus::Failed, Some(error));
    }

    pub fn cancel(&mut self) {
        self.finish(
            ExecutionStatus::Cancelled,
            Some(ExecutionError::new(ErrorKind::Cancellation, "execution cancelled")),
        );
    }

    fn finish(&mut self, status: ExecutionStatus, error: Option<ExecutionError>) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }

    pub fn count_nodes(&self, status: NodeStatus) -> usize {
        self.node_executions
            .iter()
            .filter(|n| n.status == status)
            .count()
    }
}
