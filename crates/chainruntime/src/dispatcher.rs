use crate::cache::ExecutionCache;
use crate::expression::{self, ExpressionError};
use crate::pool::ConnectionPool;
use crate::registry::ServerRegistry;
use chaincore::{NodeError, NodeKind, NodeSpec, NodeType, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Output key used for tool results without an output variable
const DEFAULT_OUTPUT: &str = "result";

/// Result of running one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutcome {
    /// Resolved inputs, recorded on the node execution and used as cache key
    pub inputs: HashMap<String, Value>,
    pub outputs: HashMap<String, Value>,
    /// Context variables to set once the node completes
    pub variables: HashMap<String, Value>,
    /// Branch taken by a condition node
    pub branch: Option<bool>,
    pub return_value: Option<Value>,
    pub cached: bool,
}

impl From<ExpressionError> for NodeError {
    fn from(e: ExpressionError) -> Self {
        NodeError::Expression(e.to_string())
    }
}

/// Executes a single node by type, consulting the cache and borrowing
/// connections from the pool.
#[derive(Clone)]
pub struct NodeDispatcher {
    cache: Arc<ExecutionCache>,
    pool: ConnectionPool,
    registry: Arc<ServerRegistry>,
}

impl NodeDispatcher {
    pub fn new(cache: Arc<ExecutionCache>, pool: ConnectionPool, registry: Arc<ServerRegistry>) -> Self {
        Self {
            cache,
            pool,
            registry,
        }
    }

    pub async fn dispatch(
        &self,
        node: &NodeSpec,
        context: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        if cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        match &node.kind {
            NodeKind::Start => Ok(NodeOutcome::default()),
            NodeKind::End { return_value } => self.run_end(return_value.as_deref(), context),
            NodeKind::Condition { condition } => self.run_condition(condition, context),
            NodeKind::Transform {
                input_variable,
                expression,
                output_variable,
            } => self.run_transform(node, input_variable, expression, output_variable, context),
            NodeKind::McpTool {
                server_id,
                tool_name,
                parameters,
                output_variable,
            } => {
                self.run_tool(
                    node,
                    server_id,
                    tool_name,
                    parameters,
                    output_variable.as_deref(),
                    context,
                    cancel,
                )
                .await
            }
        }
    }

    fn run_end(
        &self,
        return_value: Option<&str>,
        context: &HashMap<String, Value>,
    ) -> Result<NodeOutcome, NodeError> {
        let Some(template) = return_value.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(NodeOutcome::default());
        };

        let value = if template.contains("${") {
            expression::resolve_template(template, context)?
        } else {
            expression::evaluate(template, context)?
        };

        let mut outcome = NodeOutcome::default();
        outcome
            .inputs
            .insert("return_value".to_string(), Value::from(template));
        outcome
            .outputs
            .insert("return_value".to_string(), value.clone());
        outcome.return_value = Some(value);
        Ok(outcome)
    }

    fn run_condition(
        &self,
        condition: &str,
        context: &HashMap<String, Value>,
    ) -> Result<NodeOutcome, NodeError> {
        let taken = expression::evaluate_condition(condition, context)?;
        debug!("Condition '{}' evaluated to {}", condition, taken);

        let mut outcome = NodeOutcome::default();
        outcome
            .inputs
            .insert("condition".to_string(), Value::from(condition));
        outcome.outputs.insert("result".to_string(), Value::Bool(taken));
        outcome.branch = Some(taken);
        Ok(outcome)
    }

    fn run_transform(
        &self,
        node: &NodeSpec,
        input_variable: &str,
        expression: &str,
        output_variable: &str,
        context: &HashMap<String, Value>,
    ) -> Result<NodeOutcome, NodeError> {
        let input = context
            .get(input_variable)
            .cloned()
            .ok_or_else(|| NodeError::MissingInput(input_variable.to_string()))?;

        let mut inputs = HashMap::new();
        inputs.insert("expression".to_string(), Value::from(expression));
        inputs.insert(input_variable.to_string(), input.clone());

        if let Some(outputs) = self.cache.get(&node.id, NodeType::Transform, &inputs) {
            return Ok(cached_outcome(inputs, outputs, Some(output_variable)));
        }

        // the expression only sees its input, so the cache key is complete
        let mut scope = HashMap::new();
        scope.insert(input_variable.to_string(), input.clone());
        scope.insert("input".to_string(), input);
        let value = expression::evaluate(expression, &scope)?;

        let mut outcome = NodeOutcome {
            inputs,
            ..NodeOutcome::default()
        };
        outcome
            .outputs
            .insert(output_variable.to_string(), value.clone());
        outcome.variables.insert(output_variable.to_string(), value);
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tool(
        &self,
        node: &NodeSpec,
        server_id: &str,
        tool_name: &str,
        parameters: &HashMap<String, Value>,
        output_variable: Option<&str>,
        context: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let arguments = expression::resolve_value(&Value::Object(parameters.clone()), context)?;

        let mut inputs = HashMap::new();
        inputs.insert("server_id".to_string(), Value::from(server_id));
        inputs.insert("tool_name".to_string(), Value::from(tool_name));
        inputs.insert("arguments".to_string(), arguments.clone());

        if let Some(outputs) = self.cache.get(&node.id, NodeType::McpTool, &inputs) {
            return Ok(cached_outcome(inputs, outputs, output_variable));
        }

        let server = self.registry.resolve(server_id)?;
        let mut lease = self.pool.get(server, cancel).await?;
        debug!(
            "Calling tool {} on {} (connection {})",
            tool_name,
            server_id,
            lease.connection_id()
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(NodeError::Cancelled),
            result = lease.client().call_tool(tool_name, arguments.to_json()) => result,
        };
        if matches!(result, Err(NodeError::Connection(_)) | Err(NodeError::Cancelled)) {
            lease.mark_broken();
        }
        drop(lease);
        let value = result?;

        let key = output_variable.unwrap_or(DEFAULT_OUTPUT);
        let mut outcome = NodeOutcome {
            inputs,
            ..NodeOutcome::default()
        };
        outcome.outputs.insert(key.to_string(), value.clone());
        if let Some(variable) = output_variable {
            outcome.variables.insert(variable.to_string(), value);
        }
        Ok(outcome)
    }
}

fn cached_outcome(
    inputs: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
    output_variable: Option<&str>,
) -> NodeOutcome {
    let variables = output_variable
        .and_then(|name| outputs.get(name).map(|v| (name.to_string(), v.clone())))
        .into_iter()
        .collect();
    NodeOutcome {
        inputs,
        outputs,
        variables,
        cached: true,
        ..NodeOutcome::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PoolConfig};
    use async_trait::async_trait;
    use chaincore::{ConnectionError, ServerConfig, ToolClient, ToolConnector, ToolInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoClient;

    #[async_trait]
    impl ToolClient for EchoClient {
        async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<Value, NodeError> {
            if name == "fail" {
                return Err(NodeError::ToolCall {
                    tool: name.to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(Value::from(arguments))
        }

        async fn list_tools(&self) -> Result<Vec<ToolInfo>, ConnectionError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct EchoConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl ToolConnector for EchoConnector {
        async fn connect(&self, _server: &ServerConfig) -> Result<Arc<dyn ToolClient>, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoClient))
        }
    }

    fn dispatcher() -> (NodeDispatcher, Arc<EchoConnector>) {
        let connector = Arc::new(EchoConnector::default());
        let mut registry = ServerRegistry::new();
        registry.register(ServerConfig::local("echo"));
        let dispatcher = NodeDispatcher::new(
            Arc::new(ExecutionCache::new(CacheConfig::default())),
            ConnectionPool::new(PoolConfig::default(), connector.clone()),
            Arc::new(registry),
        );
        (dispatcher, connector)
    }

    fn context() -> HashMap<String, Value> {
        let mut ctx = HashMap::new();
        ctx.insert("x".to_string(), Value::from(5));
        ctx
    }

    #[tokio::test]
    async fn test_transform_binds_output_variable() {
        let (dispatcher, _) = dispatcher();
        let node = NodeSpec::transform("double", "x", "x * 2", "y");
        let outcome = dispatcher
            .dispatch(&node, &context(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.variables.get("y"), Some(&Value::Number(10.0)));
        assert!(!outcome.cached);

        let node = NodeSpec::transform("double", "missing", "input", "y");
        let err = dispatcher
            .dispatch(&node, &context(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::MissingInput("missing".to_string()));
    }

    #[tokio::test]
    async fn test_condition_and_end() {
        let (dispatcher, _) = dispatcher();
        let cancel = CancellationToken::new();
        let outcome = dispatcher
            .dispatch(&NodeSpec::condition("check", "x > 10"), &context(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.branch, Some(false));

        let outcome = dispatcher
            .dispatch(&NodeSpec::end("end", Some("${x}")), &context(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.return_value, Some(Value::Number(5.0)));
    }

    #[tokio::test]
    async fn test_tool_call_resolves_parameters_and_reuses_connection() {
        let (dispatcher, connector) = dispatcher();
        let cancel = CancellationToken::new();
        let node = NodeSpec::tool("call", "echo", "echo")
            .with_parameter("value", "${x}")
            .with_output("echoed");

        let outcome = dispatcher.dispatch(&node, &context(), &cancel).await.unwrap();
        let echoed = outcome.variables.get("echoed").cloned().unwrap();
        assert_eq!(echoed.get_field("value"), Some(Value::Number(5.0)));

        let other = NodeSpec::tool("call2", "echo", "echo").with_parameter("value", 1);
        dispatcher.dispatch(&other, &context(), &cancel).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pool.stats().reused_gets, 1);
    }

    #[tokio::test]
    async fn test_tool_errors() {
        let (dispatcher, _) = dispatcher();
        let cancel = CancellationToken::new();

        let err = dispatcher
            .dispatch(&NodeSpec::tool("bad", "echo", "fail"), &context(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let err = dispatcher
            .dispatch(&NodeSpec::tool("unknown", "nowhere", "echo"), &context(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NodeError::Connection(ConnectionError::UnknownServer("nowhere".to_string()))
        );

        cancel.cancel();
        let err = dispatcher
            .dispatch(&NodeSpec::start("start"), &context(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::Cancelled);
    }
}
