use crate::cache::ExecutionCache;
use crate::config::{ConfigError, EngineConfig};
use crate::dispatcher::NodeDispatcher;
use crate::pool::ConnectionPool;
use crate::registry::ServerRegistry;
use crate::scheduler::{self, RunSettings, Scheduler};
use chaincore::{
    Execution, ExecutionMonitor, FlowError, NodeKind, Subscription, ToolConnector, Value, Workflow,
    WorkflowError,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs workflows against a fixed set of tool servers.
///
/// The cache, connection pool and monitor are shared by every execution
/// started from the same engine.
pub struct ExecutionEngine {
    config: EngineConfig,
    registry: Arc<ServerRegistry>,
    cache: Arc<ExecutionCache>,
    pool: ConnectionPool,
    monitor: Arc<ExecutionMonitor>,
    closed: AtomicBool,
}

impl ExecutionEngine {
    /// Create an engine. Must be called inside a tokio runtime for the pool's
    /// idle reaper to run.
    pub fn new(
        config: EngineConfig,
        registry: ServerRegistry,
        connector: Arc<dyn ToolConnector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = Arc::new(ExecutionCache::new(config.cache.clone()));
        let pool = ConnectionPool::new(config.pool.clone(), connector);
        let monitor = Arc::new(ExecutionMonitor::new(config.monitor_buffer));
        info!(
            "Execution engine ready with {} servers, max {} parallel nodes",
            registry.len(),
            config.max_parallel_nodes
        );

        Ok(Self {
            config,
            registry: Arc::new(registry),
            cache,
            pool,
            monitor,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    /// Subscribe to events of every execution run by this engine
    pub fn subscribe(&self) -> Subscription {
        self.monitor.subscribe()
    }

    pub fn cache(&self) -> &Arc<ExecutionCache> {
        &self.cache
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Servers visible to `workflow`: its inline declarations, with the
    /// engine's own registrations taking precedence.
    fn registry_for(&self, workflow: &Workflow) -> ServerRegistry {
        ServerRegistry::from_workflow(workflow).merge(&self.registry)
    }

    /// Validate a workflow without running it.
    pub fn validate(&self, workflow: &Workflow, inputs: &HashMap<String, Value>) -> Result<(), WorkflowError> {
        let context = workflow.initial_context(inputs);
        scheduler::validate(workflow, &self.registry_for(workflow), &context).map(|_| ())
    }

    /// Run a workflow to completion.
    ///
    /// Validation failures are returned as errors before any node runs. Once
    /// the run starts its outcome, including node failures and cancellation,
    /// is recorded in the returned `Execution`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Execution, FlowError> {
        if self.is_closed() {
            return Err(FlowError::EngineClosed);
        }

        let registry = Arc::new(self.registry_for(workflow));
        let context = workflow.initial_context(&inputs);
        let graph = scheduler::validate(workflow, &registry, &context)?;
        let execution = Execution::new(workflow, context);

        if self.config.prewarm_servers {
            let servers: Vec<String> = workflow
                .nodes
                .iter()
                .filter_map(|node| match &node.kind {
                    NodeKind::McpTool { server_id, .. } => Some(server_id.clone()),
                    _ => None,
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            self.pool.pre_warm(&registry, &servers, &cancel).await;
        }

        let dispatcher = Arc::new(NodeDispatcher::new(
            self.cache.clone(),
            self.pool.clone(),
            registry,
        ));
        let settings = RunSettings {
            max_parallel: self.config.max_parallel_nodes,
            retry: self.config.retry.clone(),
            node_timeout: self.config.node_timeout(),
        };

        let scheduler = Scheduler::new(
            workflow,
            &graph,
            dispatcher,
            self.cache.clone(),
            self.monitor.clone(),
            settings,
            cancel,
        );
        Ok(scheduler.run(execution).await)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release pooled connections, end monitor subscriptions and drop cached
    /// results. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
        self.monitor.close();
        self.cache.clear();
        info!("Execution engine closed");
    }
}
