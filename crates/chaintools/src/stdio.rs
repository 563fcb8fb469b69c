use crate::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use chaincore::{ConnectionError, NodeError, ToolClient, ToolInfo, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct StdioChannel {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Tool server running as a child process, speaking line-delimited JSON-RPC
/// over stdin/stdout.
pub struct StdioToolClient {
    server_id: String,
    child: Mutex<Child>,
    channel: Mutex<StdioChannel>,
    next_id: AtomicU64,
    healthy: AtomicBool,
}

impl StdioToolClient {
    /// Spawn the server process and perform the `initialize` handshake.
    pub async fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, ConnectionError> {
        let connect_failed = |message: String| ConnectionError::ConnectFailed {
            server_id: server_id.to_string(),
            message,
        };

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connect_failed(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_failed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connect_failed("stdout not captured".to_string()))?;

        let client = Self {
            server_id: server_id.to_string(),
            child: Mutex::new(child),
            channel: Mutex::new(StdioChannel {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        };

        client
            .request("initialize", jsonrpc::initialize_params("chaintools"))
            .await
            .and_then(JsonRpcResponse::into_result)
            .map_err(|e| connect_failed(e.to_string()))?;
        client
            .send(&JsonRpcRequest::notification("notifications/initialized"))
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        debug!("Started stdio tool server {} ({})", server_id, command);
        Ok(client)
    }

    fn transport_error(&self, message: String) -> ConnectionError {
        self.healthy.store(false, Ordering::Relaxed);
        ConnectionError::Transport(message)
    }

    async fn write_line(&self, channel: &mut StdioChannel, request: &JsonRpcRequest) -> Result<(), ConnectionError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|e| ConnectionError::Transport(format!("failed to encode request: {}", e)))?;
        line.push(b'\n');
        channel
            .stdin
            .write_all(&line)
            .await
            .map_err(|e| self.transport_error(format!("write to {} failed: {}", self.server_id, e)))?;
        channel
            .stdin
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("flush to {} failed: {}", self.server_id, e)))
    }

    async fn send(&self, request: &JsonRpcRequest) -> Result<(), ConnectionError> {
        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, request).await
    }

    /// Send a request and wait for the response carrying its id. Server
    /// notifications and unrelated lines are skipped.
    async fn request(&self, method: &str, params: serde_json::Value) -> Result<JsonRpcResponse, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = JsonRpcRequest::call(id, method, params);

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &request).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = channel
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| self.transport_error(format!("read from {} failed: {}", self.server_id, e)))?;
            if read == 0 {
                return Err(self.transport_error(format!("{} closed its output", self.server_id)));
            }
            match serde_json::from_str::<JsonRpcResponse>(line.trim()) {
                Ok(response) if response.matches(id) => return Ok(response),
                Ok(_) => continue,
                Err(_) => debug!("Ignoring non JSON-RPC output from {}", self.server_id),
            }
        }
    }
}

#[async_trait]
impl ToolClient for StdioToolClient {
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<Value, NodeError> {
        let response = self
            .request("tools/call", jsonrpc::call_params(name, arguments))
            .await?;
        jsonrpc::tool_result(name, response)
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ConnectionError> {
        let response = self
            .request("tools/list", serde_json::json!({}))
            .await?;
        jsonrpc::tool_list(response.into_result()?)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.healthy.store(false, Ordering::Relaxed);
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!("Failed to stop tool server {}: {}", self.server_id, e);
            return Err(ConnectionError::Transport(e.to_string()));
        }
        Ok(())
    }
}
