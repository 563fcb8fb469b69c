//! Tool server clients
//!
//! Connectors for the transports a workflow can declare: child processes
//! speaking JSON-RPC over stdio, HTTP endpoints, and in-process servers.

mod connector;
mod http;
mod jsonrpc;
mod local;
mod stdio;

pub use connector::TransportConnector;
pub use http::HttpToolClient;
pub use jsonrpc::PROTOCOL_VERSION;
pub use local::{LocalClient, LocalConnector, LocalToolServer};
pub use stdio::StdioToolClient;
