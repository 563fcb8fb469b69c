//! Audit trail reconstruction.
//!
//! The trail is derived on demand from a stored [`Execution`]; nothing here
//! reads clocks or shared state, so the same execution always yields the
//! same sequence.

use crate::{Execution, ExecutionStatus, NodeExecution, NodeStatus, NodeType, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExecutionStarted,
    VariableSet,
    NodeStarted,
    NodeRetried,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    Error,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ExecutionStarted => "execution_started",
            AuditEventType::VariableSet => "variable_set",
            AuditEventType::NodeStarted => "node_started",
            AuditEventType::NodeRetried => "node_retried",
            AuditEventType::NodeCompleted => "node_completed",
            AuditEventType::NodeFailed => "node_failed",
            AuditEventType::NodeSkipped => "node_skipped",
            AuditEventType::Error => "error",
            AuditEventType::ExecutionCompleted => "execution_completed",
            AuditEventType::ExecutionFailed => "execution_failed",
            AuditEventType::ExecutionCancelled => "execution_cancelled",
        }
    }

    pub fn is_variable_change(&self) -> bool {
        matches!(self, AuditEventType::VariableSet)
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub message: String,
    pub node_id: Option<String>,
    pub node_type: Option<NodeType>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl AuditEvent {
    fn new(timestamp: DateTime<Utc>, event_type: AuditEventType, message: String) -> Self {
        Self {
            timestamp,
            event_type,
            message,
            node_id: None,
            node_type: None,
            duration_ms: None,
            details: BTreeMap::new(),
        }
    }

    fn for_node(mut self, node: &NodeExecution) -> Self {
        self.node_id = Some(node.node_id.clone());
        self.node_type = Some(node.node_type);
        self
    }

    fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Per-type event counts of a trail
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditCounts {
    pub total: usize,
    pub by_type: BTreeMap<AuditEventType, usize>,
}

impl AuditCounts {
    fn from_events(events: &[AuditEvent]) -> Self {
        let mut by_type = BTreeMap::new();
        for event in events {
            *by_type.entry(event.event_type).or_insert(0) += 1;
        }
        Self {
            total: events.len(),
            by_type,
        }
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.by_type.get(&event_type).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub execution_id: String,
    pub events: Vec<AuditEvent>,
    pub counts: AuditCounts,
}

/// Selection applied by [`filter_events`]. An empty `event_types` list
/// selects every type; variable changes are only kept when
/// `include_variable_changes` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub event_types: Vec<AuditEventType>,
    #[serde(default)]
    pub include_variable_changes: bool,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl AuditFilter {
    pub fn all() -> Self {
        Self {
            event_types: Vec::new(),
            include_variable_changes: true,
            node_id: None,
        }
    }

    pub fn types(event_types: &[AuditEventType]) -> Self {
        Self {
            event_types: event_types.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if event.event_type.is_variable_change() && !self.include_variable_changes {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        match &self.node_id {
            Some(node_id) => event.node_id.as_deref() == Some(node_id.as_str()),
            None => true,
        }
    }
}

/// Derive the chronological event log of an execution.
pub fn reconstruct_audit_trail(execution: &Execution) -> AuditTrail {
    let mut events = Vec::new();

    events.push(
        AuditEvent::new(
            execution.started_at,
            AuditEventType::ExecutionStarted,
            format!(
                "Execution {} started for workflow {} (version {})",
                execution.id, execution.workflow_id, execution.workflow_version
            ),
        )
        .detail("workflow_id", execution.workflow_id.as_str())
        .detail("workflow_version", execution.workflow_version.as_str())
        .detail("inputs", execution.inputs.len() as f64),
    );

    for (name, value) in sorted(&execution.inputs) {
        events.push(
            AuditEvent::new(
                execution.started_at,
                AuditEventType::VariableSet,
                format!("Variable '{}' initialized to {}", name, value),
            )
            .detail("name", name.as_str())
            .detail("value", value.clone())
            .detail("source", "input"),
        );
    }

    for node in &execution.node_executions {
        node_events(node, execution.started_at, &mut events);
    }

    if let Some(completed_at) = execution.completed_at {
        let duration = execution.duration_ms();
        match execution.status {
            ExecutionStatus::Failed => {
                if let Some(error) = &execution.error {
                    let mut event = AuditEvent::new(
                        completed_at,
                        AuditEventType::Error,
                        format!("{} error: {}", error.kind, error.message),
                    )
                    .detail("kind", error.kind.to_string());
                    event.node_id = error.node_id.clone();
                    for (key, value) in &error.context {
                        event = event.detail(key, value.as_str());
                    }
                    events.push(event);
                }
                let mut event = AuditEvent::new(
                    completed_at,
                    AuditEventType::ExecutionFailed,
                    format!("Execution {} failed", execution.id),
                );
                event.duration_ms = duration;
                events.push(event);
            }
            ExecutionStatus::Cancelled => {
                let mut event = AuditEvent::new(
                    completed_at,
                    AuditEventType::ExecutionCancelled,
                    format!("Execution {} cancelled", execution.id),
                );
                event.duration_ms = duration;
                events.push(event);
            }
            _ => {
                let mut event = AuditEvent::new(
                    completed_at,
                    AuditEventType::ExecutionCompleted,
                    format!("Execution {} completed", execution.id),
                );
                event.duration_ms = duration;
                if let Some(value) = &execution.return_value {
                    event = event.detail("return_value", value.clone());
                }
                events.push(event);
            }
        }
    }

    // Stable: events sharing a timestamp keep their derivation order.
    events.sort_by_key(|event| event.timestamp);

    AuditTrail {
        execution_id: execution.id.clone(),
        counts: AuditCounts::from_events(&events),
        events,
    }
}

fn node_events(node: &NodeExecution, fallback: DateTime<Utc>, events: &mut Vec<AuditEvent>) {
    if let Some(started_at) = node.started_at {
        events.push(
            AuditEvent::new(
                started_at,
                AuditEventType::NodeStarted,
                format!("Node {} ({}) started", node.node_id, node.node_type),
            )
            .for_node(node),
        );
    }

    for retry in &node.retries {
        events.push(
            AuditEvent::new(
                retry.failed_at,
                AuditEventType::NodeRetried,
                format!(
                    "Node {} attempt {} failed, retrying: {}",
                    node.node_id, retry.attempt, retry.error
                ),
            )
            .for_node(node)
            .detail("attempt", retry.attempt as f64),
        );
    }

    let finished_at = node.completed_at.or(node.started_at).unwrap_or(fallback);
    match node.status {
        NodeStatus::Completed => {
            let mut event = AuditEvent::new(
                finished_at,
                AuditEventType::NodeCompleted,
                format!("Node {} ({}) completed", node.node_id, node.node_type),
            )
            .for_node(node)
            .detail("cached", node.cached)
            .detail("retry_count", node.retry_count as f64);
            event.duration_ms = node.duration_ms();
            events.push(event);

            for (name, value) in sorted(&node.outputs) {
                events.push(
                    AuditEvent::new(
                        finished_at,
                        AuditEventType::VariableSet,
                        format!("Variable '{}' set to {} by node {}", name, value, node.node_id),
                    )
                    .for_node(node)
                    .detail("name", name.as_str())
                    .detail("value", value.clone())
                    .detail("source", node.node_id.as_str()),
                );
            }
        }
        NodeStatus::Failed => {
            let message = node
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            let mut event = AuditEvent::new(
                finished_at,
                AuditEventType::NodeFailed,
                format!("Node {} ({}) failed: {}", node.node_id, node.node_type, message),
            )
            .for_node(node)
            .detail("retry_count", node.retry_count as f64);
            if let Some(error) = &node.error {
                event = event.detail("kind", error.kind.to_string());
            }
            event.duration_ms = node.duration_ms();
            events.push(event);
        }
        NodeStatus::Skipped => {
            let reason = node
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "not on the taken path".to_string());
            events.push(
                AuditEvent::new(
                    finished_at,
                    AuditEventType::NodeSkipped,
                    format!("Node {} ({}) skipped: {}", node.node_id, node.node_type, reason),
                )
                .for_node(node),
            );
        }
        NodeStatus::Pending | NodeStatus::Running => {}
    }
}

fn sorted(map: &std::collections::HashMap<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

/// Order-preserving subsequence of `events` selected by `filter`.
pub fn filter_events(events: &[AuditEvent], filter: &AuditFilter) -> Vec<AuditEvent> {
    events
        .iter()
        .filter(|event| filter.matches(event))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, ExecutionError, Workflow};
    use chrono::Duration;
    use std::collections::HashMap;

    fn failed_execution() -> Execution {
        let workflow = Workflow::new("audit");
        let mut inputs = HashMap::new();
        inputs.insert("x".to_string(), Value::from(5));
        inputs.insert("a".to_string(), Value::from("first"));

        let mut execution = Execution::new(&workflow, inputs);
        let t0 = execution.started_at;

        let mut start = NodeExecution::new("start", NodeType::Start);
        start.status = NodeStatus::Completed;
        start.started_at = Some(t0 + Duration::milliseconds(1));
        start.completed_at = Some(t0 + Duration::milliseconds(2));

        let mut double = NodeExecution::new("double", NodeType::Transform);
        double.status = NodeStatus::Completed;
        double.started_at = Some(t0 + Duration::milliseconds(3));
        double.completed_at = Some(t0 + Duration::milliseconds(4));
        double.outputs.insert("y".to_string(), Value::from(10));

        let mut tool = NodeExecution::new("fetch", NodeType::McpTool);
        tool.status = NodeStatus::Failed;
        tool.started_at = Some(t0 + Duration::milliseconds(5));
        tool.retries.push(crate::RetryAttempt {
            attempt: 1,
            failed_at: t0 + Duration::milliseconds(6),
            error: "connection reset".to_string(),
        });
        tool.retry_count = 1;
        tool.completed_at = Some(t0 + Duration::milliseconds(8));
        tool.error = Some(ExecutionError::new(ErrorKind::Connection, "connection reset").for_node("fetch"));

        let mut end = NodeExecution::new("end", NodeType::End);
        end.status = NodeStatus::Skipped;
        end.completed_at = Some(t0 + Duration::milliseconds(8));

        execution.node_executions = vec![start, double, tool, end];
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(
            ExecutionError::new(ErrorKind::NodeExecution, "node fetch failed")
                .for_node("fetch")
                .with_context("attempts", "2"),
        );
        execution.completed_at = Some(t0 + Duration::milliseconds(9));
        execution
    }

    #[test]
    fn test_reconstruction_is_deterministic() {
        let execution = failed_execution();
        let first = reconstruct_audit_trail(&execution);
        let second = reconstruct_audit_trail(&execution);
        assert_eq!(first, second);
    }

    #[test]
    fn test_events_are_chronological() {
        let trail = reconstruct_audit_trail(&failed_execution());
        let types: Vec<_> = trail.events.iter().map(|e| e.event_type).collect();

        assert_eq!(types.first(), Some(&AuditEventType::ExecutionStarted));
        assert_eq!(types.last(), Some(&AuditEventType::ExecutionFailed));
        assert!(trail
            .events
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));

        // Inputs are reported in name order right after the start.
        assert_eq!(trail.events[1].details.get("name"), Some(&Value::from("a")));
        assert_eq!(trail.events[2].details.get("name"), Some(&Value::from("x")));
    }

    #[test]
    fn test_counts() {
        let trail = reconstruct_audit_trail(&failed_execution());
        assert_eq!(trail.counts.total, trail.events.len());
        assert_eq!(trail.counts.count(AuditEventType::NodeCompleted), 2);
        assert_eq!(trail.counts.count(AuditEventType::NodeRetried), 1);
        assert_eq!(trail.counts.count(AuditEventType::NodeSkipped), 1);
        assert_eq!(trail.counts.count(AuditEventType::VariableSet), 3);
        assert_eq!(trail.counts.count(AuditEventType::Error), 1);
    }

    #[test]
    fn test_filter_error_types_preserves_order() {
        let trail = reconstruct_audit_trail(&failed_execution());
        let filter = AuditFilter::types(&[
            AuditEventType::Error,
            AuditEventType::NodeFailed,
            AuditEventType::ExecutionFailed,
        ]);
        let filtered = filter_events(&trail.events, &filter);

        let types: Vec<_> = filtered.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                AuditEventType::NodeFailed,
                AuditEventType::Error,
                AuditEventType::ExecutionFailed
            ]
        );
    }

    #[test]
    fn test_filter_variable_changes() {
        let trail = reconstruct_audit_trail(&failed_execution());

        let without = filter_events(&trail.events, &AuditFilter::default());
        assert!(without.iter().all(|e| !e.event_type.is_variable_change()));

        let with = filter_events(&trail.events, &AuditFilter::all());
        assert_eq!(with.len(), trail.events.len());

        let by_node = AuditFilter {
            node_id: Some("double".to_string()),
            ..AuditFilter::all()
        };
        let double_events = filter_events(&trail.events, &by_node);
        assert_eq!(double_events.len(), 3);
    }

    #[test]
    fn test_running_execution_has_no_terminal_event() {
        let workflow = Workflow::new("running");
        let mut execution = Execution::new(&workflow, HashMap::new());
        execution.start();
        let trail = reconstruct_audit_trail(&execution);
        assert_eq!(trail.events.len(), 1);
    }
}
