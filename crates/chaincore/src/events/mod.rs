// crates/chaincore/src/events/mod.rs

mod base;
mod monitor;

pub use base::ExecutionEvent;
pub use monitor::{ExecutionMonitor, ExecutionProgress, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
