use crate::cache::ExecutionCache;
use crate::config::RetryPolicy;
use crate::dispatcher::{NodeDispatcher, NodeOutcome};
use crate::registry::ServerRegistry;
use chaincore::{
    ErrorKind, Execution, ExecutionError, ExecutionEvent, ExecutionMonitor, NodeError, NodeExecution,
    NodeId, NodeKind, NodeSpec, NodeStatus, NodeType, RetryAttempt, Value, Workflow, WorkflowError,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Validated dependency graph of a workflow. Edge weights carry the branch
/// label of condition edges.
pub(crate) struct WorkflowGraph {
    graph: DiGraph<NodeId, Option<bool>>,
    order: Vec<NodeIndex>,
}

impl WorkflowGraph {
    fn node_id(&self, idx: NodeIndex) -> &str {
        &self.graph[idx]
    }
}

/// Check the structural rules a workflow must satisfy before any node runs.
pub(crate) fn validate(
    workflow: &Workflow,
    registry: &ServerRegistry,
    context: &HashMap<String, Value>,
) -> Result<WorkflowGraph, WorkflowError> {
    if workflow.nodes.is_empty() {
        return Err(WorkflowError::Invalid("workflow has no nodes".to_string()));
    }

    let mut graph = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &workflow.nodes {
        if index.contains_key(node.id.as_str()) {
            return Err(WorkflowError::DuplicateNode(node.id.clone()));
        }
        let idx = graph.add_node(node.id.clone());
        index.insert(node.id.as_str(), idx);
    }

    let starts: Vec<&NodeSpec> = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type() == NodeType::Start)
        .collect();
    if starts.len() != 1 {
        return Err(WorkflowError::StartNode(starts.len()));
    }
    let start = index[starts[0].id.as_str()];

    let mut labels: HashSet<(&str, bool)> = HashSet::new();
    for edge in &workflow.edges {
        let from = *index
            .get(edge.from.as_str())
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.from.clone()))?;
        let to = *index
            .get(edge.to.as_str())
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.to.clone()))?;
        if to == start {
            return Err(WorkflowError::InvalidConnection(format!(
                "start node '{}' cannot have incoming edges",
                edge.to
            )));
        }

        let is_condition = workflow
            .find_node(&edge.from)
            .map_or(false, |n| n.node_type() == NodeType::Condition);
        let branch = edge.branch();
        match (is_condition, branch) {
            (true, Some(label)) => {
                if !labels.insert((edge.from.as_str(), label)) {
                    return Err(WorkflowError::InvalidConnection(format!(
                        "condition '{}' has more than one '{}' edge",
                        edge.from, label
                    )));
                }
            }
            (true, None) => {
                return Err(WorkflowError::InvalidConnection(format!(
                    "edge {} -> {} from a condition must be labelled true or false",
                    edge.from, edge.to
                )))
            }
            (false, _) if edge.condition.is_some() => {
                return Err(WorkflowError::InvalidConnection(format!(
                    "edge {} -> {} is labelled but '{}' is not a condition",
                    edge.from, edge.to, edge.from
                )))
            }
            (false, _) => {}
        }
        graph.add_edge(from, to, branch);
    }

    let order = toposort(&graph, None).map_err(|_| WorkflowError::CyclicDependency)?;

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, start);
    while let Some(idx) = dfs.next(&graph) {
        reachable.insert(idx);
    }
    if let Some(node) = workflow
        .nodes
        .iter()
        .find(|n| !reachable.contains(&index[n.id.as_str()]))
    {
        return Err(WorkflowError::Unreachable(node.id.clone()));
    }

    for node in &workflow.nodes {
        if let NodeKind::McpTool { server_id, .. } = &node.kind {
            if !registry.contains(server_id) {
                return Err(WorkflowError::UnknownServer {
                    node_id: node.id.clone(),
                    server_id: server_id.clone(),
                });
            }
        }
    }

    if let Some(missing) = workflow
        .variables
        .iter()
        .find(|v| v.required && !context.contains_key(&v.name))
    {
        return Err(WorkflowError::MissingVariable(missing.name.clone()));
    }

    Ok(WorkflowGraph { graph, order })
}

/// Limits applied while running a workflow
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub max_parallel: usize,
    pub retry: RetryPolicy,
    pub node_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    Running,
    Done(NodeStatus),
}

struct NodeReport {
    result: Result<NodeOutcome, NodeError>,
    retries: Vec<RetryAttempt>,
}

/// Walks the workflow graph, dispatching ready nodes as spawned tasks.
///
/// The scheduler owns the `Execution` record and is the only writer of the
/// variable context; tasks receive a snapshot taken when they start.
pub(crate) struct Scheduler<'a> {
    workflow: &'a Workflow,
    graph: &'a WorkflowGraph,
    dispatcher: Arc<NodeDispatcher>,
    cache: Arc<ExecutionCache>,
    monitor: Arc<ExecutionMonitor>,
    settings: RunSettings,
    cancel: CancellationToken,
    slots: HashMap<NodeIndex, Slot>,
    branches: HashMap<NodeIndex, bool>,
    /// Skipped nodes that sit downstream of a failed node
    tainted: HashSet<NodeIndex>,
    records: HashMap<NodeIndex, usize>,
    ready: VecDeque<NodeIndex>,
    failure: Option<ExecutionError>,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        workflow: &'a Workflow,
        graph: &'a WorkflowGraph,
        dispatcher: Arc<NodeDispatcher>,
        cache: Arc<ExecutionCache>,
        monitor: Arc<ExecutionMonitor>,
        settings: RunSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow,
            graph,
            dispatcher,
            cache,
            monitor,
            settings,
            cancel,
            slots: HashMap::new(),
            branches: HashMap::new(),
            tainted: HashSet::new(),
            records: HashMap::new(),
            ready: VecDeque::new(),
            failure: None,
        }
    }

    fn spec(&self, idx: NodeIndex) -> Option<&'a NodeSpec> {
        self.workflow.find_node(self.graph.node_id(idx))
    }

    fn node_type(&self, idx: NodeIndex) -> NodeType {
        self.spec(idx).map_or(NodeType::Start, NodeSpec::node_type)
    }

    pub(crate) async fn run(mut self, mut execution: Execution) -> Execution {
        execution.start();
        info!(
            "Starting execution {} of workflow {}",
            execution.id, execution.workflow_id
        );
        self.monitor.publish(ExecutionEvent::ExecutionStarted {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            total_nodes: self.workflow.nodes.len(),
            timestamp: Utc::now(),
        });

        let mut running = FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.advance(&mut execution);

            while running.len() < self.settings.max_parallel {
                let Some(idx) = self.ready.pop_front() else { break };
                running.push(self.spawn_node(idx, &mut execution));
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some((idx, joined)) = running.next() => {
                    let report = match joined {
                        Ok(report) => report,
                        Err(e) => NodeReport {
                            result: Err(NodeError::Configuration(format!("node task aborted: {}", e))),
                            retries: Vec::new(),
                        },
                    };
                    self.finish_node(idx, report, &mut execution);
                }
            }
        }

        if cancelled {
            self.cancel_in_flight(running, &mut execution).await;
            execution.cancel();
            warn!("Execution {} cancelled", execution.id);
        } else if let Some(err) = self.failure.take() {
            error!("Execution {} failed: {}", execution.id, err.message);
            execution.fail(err);
        } else {
            execution.complete();
            info!("Execution {} completed", execution.id);
        }

        self.monitor.publish(ExecutionEvent::ExecutionCompleted {
            execution_id: execution.id.clone(),
            status: execution.status,
            duration_ms: execution.duration_ms().unwrap_or(0),
            timestamp: Utc::now(),
        });
        execution
    }

    /// Decide every node whose parents are all terminal: queue it for
    /// dispatch or mark it skipped. Topological order lets skips cascade in
    /// a single pass.
    fn advance(&mut self, execution: &mut Execution) {
        let graph = self.graph;
        for &idx in &graph.order {
            if self.slots.contains_key(&idx) {
                continue;
            }

            let mut failed_parent = None;
            let mut live = false;
            let mut waiting = false;
            let mut has_parents = false;
            for edge in graph.graph.edges_directed(idx, Direction::Incoming) {
                has_parents = true;
                let parent = edge.source();
                match self.slots.get(&parent) {
                    Some(Slot::Done(NodeStatus::Failed)) => failed_parent = Some(parent),
                    Some(Slot::Done(NodeStatus::Skipped)) if self.tainted.contains(&parent) => {
                        failed_parent = Some(parent)
                    }
                    Some(Slot::Done(NodeStatus::Completed)) => {
                        let taken = match edge.weight() {
                            Some(label) => self.branches.get(&parent) == Some(label),
                            None => true,
                        };
                        live |= taken;
                    }
                    Some(Slot::Done(_)) => {}
                    _ => waiting = true,
                }
            }
            if waiting {
                continue;
            }

            if let Some(parent) = failed_parent {
                let reason = if self.tainted.contains(&parent) {
                    format!("upstream node '{}' was skipped after a failure", graph.node_id(parent))
                } else {
                    format!("upstream node '{}' failed", graph.node_id(parent))
                };
                self.tainted.insert(idx);
                self.skip_node(idx, reason, execution);
            } else if has_parents && !live {
                self.skip_node(idx, "branch not taken".to_string(), execution);
            } else {
                self.slots.insert(idx, Slot::Queued);
                self.ready.push_back(idx);
            }
        }
    }

    fn skip_node(&mut self, idx: NodeIndex, reason: String, execution: &mut Execution) {
        let node_id = self.graph.node_id(idx).to_string();
        let node_type = self.node_type(idx);
        debug!("Skipping node {}: {}", node_id, reason);

        let mut record = NodeExecution::new(node_id.clone(), node_type);
        record.skip(None);
        if let Some(i) = execution.push_node(record) {
            self.records.insert(idx, i);
        }
        self.slots.insert(idx, Slot::Done(NodeStatus::Skipped));
        self.monitor.publish(ExecutionEvent::NodeSkipped {
            execution_id: execution.id.clone(),
            node_id,
            node_type,
            reason,
            timestamp: Utc::now(),
        });
    }

    fn spawn_node(
        &mut self,
        idx: NodeIndex,
        execution: &mut Execution,
    ) -> impl std::future::Future<Output = (NodeIndex, Result<NodeReport, tokio::task::JoinError>)> {
        let node = self.spec(idx).cloned();
        let node_id = self.graph.node_id(idx).to_string();
        let node_type = self.node_type(idx);

        let mut record = NodeExecution::new(node_id.clone(), node_type);
        record.start(HashMap::new());
        if let Some(i) = execution.push_node(record) {
            self.records.insert(idx, i);
        }
        self.slots.insert(idx, Slot::Running);

        info!("Starting node {} ({})", node_id, node_type);
        self.monitor.publish(ExecutionEvent::NodeStarted {
            execution_id: execution.id.clone(),
            node_id: node_id.clone(),
            node_type,
            timestamp: Utc::now(),
        });

        let context = execution.context.clone();
        let dispatcher = self.dispatcher.clone();
        let monitor = self.monitor.clone();
        let settings = self.settings.clone();
        let cancel = self.cancel.clone();
        let execution_id = execution.id.clone();

        let handle = tokio::spawn(async move {
            match node {
                Some(node) => {
                    run_with_retries(&node, &context, &dispatcher, &monitor, &settings, &cancel, &execution_id)
                        .await
                }
                None => NodeReport {
                    result: Err(NodeError::Configuration(format!("unknown node {}", node_id))),
                    retries: Vec::new(),
                },
            }
        });
        async move { (idx, handle.await) }
    }

    fn finish_node(&mut self, idx: NodeIndex, report: NodeReport, execution: &mut Execution) {
        let node_id = self.graph.node_id(idx).to_string();
        let node_type = self.node_type(idx);
        let Some(&record_index) = self.records.get(&idx) else { return };
        let execution_id = execution.id.clone();

        if let Some(record) = execution.node_mut(record_index) {
            for retry in &report.retries {
                record.record_retry(retry.attempt, retry.failed_at, retry.error.clone());
            }
        }

        match report.result {
            Ok(outcome) => {
                let NodeOutcome {
                    inputs,
                    outputs,
                    variables,
                    branch,
                    return_value,
                    cached,
                } = outcome;

                let mut duration_ms = 0;
                let mut cache_entry = None;
                if let Some(record) = execution.node_mut(record_index) {
                    record.inputs = inputs;
                    record.cached = cached;
                    record.complete(outputs);
                    duration_ms = record.duration_ms().unwrap_or(0);
                    if !cached && self.cache.should_cache(record) {
                        cache_entry = Some((record.inputs.clone(), record.outputs.clone()));
                    }
                }
                if let Some((inputs, outputs)) = cache_entry {
                    if let Err(e) = self.cache.set(&node_id, node_type, &inputs, outputs) {
                        warn!("Failed to cache result of node {}: {}", node_id, e);
                    }
                }

                let mut names: Vec<&String> = variables.keys().collect();
                names.sort();
                for name in names {
                    let value = variables[name].clone();
                    execution.set_variable(name.clone(), value.clone());
                    self.monitor.publish(ExecutionEvent::VariableChanged {
                        execution_id: execution_id.clone(),
                        name: name.clone(),
                        value,
                        timestamp: Utc::now(),
                    });
                }
                if let Some(value) = return_value {
                    execution.set_return_value(value);
                }
                if let Some(branch) = branch {
                    self.branches.insert(idx, branch);
                }

                info!(
                    "Node {} completed in {}ms{}",
                    node_id,
                    duration_ms,
                    if cached { " (cached)" } else { "" }
                );
                self.slots.insert(idx, Slot::Done(NodeStatus::Completed));
                self.monitor.publish(ExecutionEvent::NodeCompleted {
                    execution_id,
                    node_id,
                    node_type,
                    duration_ms,
                    cached,
                    timestamp: Utc::now(),
                });
            }
            Err(NodeError::Cancelled) => {
                self.record_cancelled(idx, execution);
            }
            Err(e) => {
                error!("Node {} failed: {}", node_id, e);
                let attempts = report.retries.len() + 1;
                let err = ExecutionError::from_node_error(&node_id, &e)
                    .with_context("node_type", node_type.as_str())
                    .with_context("attempts", attempts.to_string());
                if let Some(record) = execution.node_mut(record_index) {
                    record.fail(err.clone());
                }
                if self.failure.is_none() {
                    self.failure = Some(err);
                }
                self.slots.insert(idx, Slot::Done(NodeStatus::Failed));
                self.monitor.publish(ExecutionEvent::NodeFailed {
                    execution_id,
                    node_id,
                    node_type,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn record_cancelled(&mut self, idx: NodeIndex, execution: &mut Execution) {
        let node_id = self.graph.node_id(idx).to_string();
        let node_type = self.node_type(idx);
        if let Some(record) = self
            .records
            .get(&idx)
            .and_then(|&i| execution.node_mut(i))
        {
            record.skip(Some(
                ExecutionError::new(ErrorKind::Cancellation, "node cancelled while running")
                    .for_node(node_id.clone()),
            ));
        }
        self.slots.insert(idx, Slot::Done(NodeStatus::Skipped));
        self.monitor.publish(ExecutionEvent::NodeSkipped {
            execution_id: execution.id.clone(),
            node_id,
            node_type,
            reason: "cancelled".to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Wait for in-flight tasks to observe cancellation and record them as
    /// skipped. Their leases are back in the pool when this returns.
    async fn cancel_in_flight<F>(&mut self, mut running: FuturesUnordered<F>, execution: &mut Execution)
    where
        F: std::future::Future<Output = (NodeIndex, Result<NodeReport, tokio::task::JoinError>)>,
    {
        while let Some((idx, _)) = running.next().await {
            self.record_cancelled(idx, execution);
        }
    }
}

async fn run_with_retries(
    node: &NodeSpec,
    context: &HashMap<String, Value>,
    dispatcher: &NodeDispatcher,
    monitor: &ExecutionMonitor,
    settings: &RunSettings,
    cancel: &CancellationToken,
    execution_id: &str,
) -> NodeReport {
    let policy = &settings.retry;
    let mut retries = Vec::new();
    let mut attempt = 1;

    loop {
        let result = match settings.node_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, dispatcher.dispatch(node, context, cancel)).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout {
                        millis: limit.as_millis() as u64,
                    }),
                }
            }
            None => dispatcher.dispatch(node, context, cancel).await,
        };

        let error = match result {
            Ok(outcome) => return NodeReport { result: Ok(outcome), retries },
            Err(e) if e.is_retryable() && attempt < policy.max_attempts && !cancel.is_cancelled() => e,
            Err(e) => return NodeReport { result: Err(e), retries },
        };

        let delay = policy.delay_for(attempt);
        warn!(
            "Node {} attempt {} failed: {}. Retrying in {}ms",
            node.id,
            attempt,
            error,
            delay.as_millis()
        );
        retries.push(RetryAttempt {
            attempt,
            failed_at: Utc::now(),
            error: error.to_string(),
        });
        monitor.publish(ExecutionEvent::NodeRetrying {
            execution_id: execution_id.to_string(),
            node_id: node.id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                return NodeReport { result: Err(NodeError::Cancelled), retries };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincore::{ServerConfig, VariableDecl};

    fn linear() -> Workflow {
        let mut workflow = Workflow::new("linear");
        workflow.add_node(NodeSpec::start("start"));
        workflow.add_node(NodeSpec::transform("double", "x", "x * 2", "y"));
        workflow.add_node(NodeSpec::end("end", Some("${y}")));
        workflow.connect("start", "double");
        workflow.connect("double", "end");
        workflow
    }

    fn check(workflow: &Workflow) -> Result<(), WorkflowError> {
        validate(workflow, &ServerRegistry::from_workflow(workflow), &HashMap::new()).map(|_| ())
    }

    #[test]
    fn test_valid_workflow_passes() {
        assert!(check(&linear()).is_ok());
    }

    #[test]
    fn test_rejects_duplicate_ids_and_missing_edges() {
        let mut workflow = linear();
        workflow.add_node(NodeSpec::end("end", None));
        assert_eq!(check(&workflow), Err(WorkflowError::DuplicateNode("end".to_string())));

        let mut workflow = linear();
        workflow.connect("double", "ghost");
        assert_eq!(check(&workflow), Err(WorkflowError::NodeNotFound("ghost".to_string())));
    }

    #[test]
    fn test_rejects_start_count_cycles_and_orphans() {
        let mut workflow = linear();
        workflow.add_node(NodeSpec::start("start2"));
        assert_eq!(check(&workflow), Err(WorkflowError::StartNode(2)));

        let mut workflow = linear();
        workflow.add_node(NodeSpec::transform("loop", "y", "y + 1", "y"));
        workflow.connect("double", "loop");
        workflow.connect("loop", "double");
        assert_eq!(check(&workflow), Err(WorkflowError::CyclicDependency));

        let mut workflow = linear();
        workflow.add_node(NodeSpec::end("orphan", None));
        assert_eq!(check(&workflow), Err(WorkflowError::Unreachable("orphan".to_string())));
    }

    #[test]
    fn test_rejects_bad_condition_labels() {
        let mut workflow = Workflow::new("branches");
        workflow.add_node(NodeSpec::start("start"));
        workflow.add_node(NodeSpec::condition("check", "x > 1"));
        workflow.add_node(NodeSpec::end("a", None));
        workflow.add_node(NodeSpec::end("b", None));
        workflow.connect("start", "check");
        workflow.connect_branch("check", "a", true);
        workflow.connect_branch("check", "b", true);
        assert!(matches!(check(&workflow), Err(WorkflowError::InvalidConnection(_))));

        let mut workflow = Workflow::new("unlabelled");
        workflow.add_node(NodeSpec::start("start"));
        workflow.add_node(NodeSpec::condition("check", "x > 1"));
        workflow.add_node(NodeSpec::end("a", None));
        workflow.connect("start", "check");
        workflow.connect("check", "a");
        assert!(matches!(check(&workflow), Err(WorkflowError::InvalidConnection(_))));
    }

    #[test]
    fn test_rejects_unknown_server_and_missing_variable() {
        let mut workflow = linear();
        workflow.add_node(NodeSpec::tool("call", "search", "query"));
        workflow.connect("start", "call");
        assert_eq!(
            check(&workflow),
            Err(WorkflowError::UnknownServer {
                node_id: "call".to_string(),
                server_id: "search".to_string(),
            })
        );
        workflow.add_server(ServerConfig::local("search"));
        assert!(check(&workflow).is_ok());

        workflow.add_variable(VariableDecl::new("x").required());
        assert_eq!(check(&workflow), Err(WorkflowError::MissingVariable("x".to_string())));
    }
}
