//! Workflow execution runtime
//!
//! This crate provides the execution engine that validates and runs
//! workflows, together with the execution cache, the tool-server connection
//! pool and the expression evaluator used by transform and condition nodes.

mod cache;
mod config;
mod dispatcher;
mod engine;
pub mod expression;
mod pool;
mod registry;
mod scheduler;

pub use cache::{CacheStats, ExecutionCache};
pub use config::{CacheConfig, CacheWeigher, ConfigError, EngineConfig, PoolConfig, RetryPolicy};
pub use dispatcher::{NodeDispatcher, NodeOutcome};
pub use engine::ExecutionEngine;
pub use pool::{ConnectionInfo, ConnectionLease, ConnectionPool, ConnectionState, PoolStats};
pub use registry::ServerRegistry;
