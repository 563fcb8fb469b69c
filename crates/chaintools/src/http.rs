use crate::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use chaincore::{ConnectionError, NodeError, ToolClient, ToolInfo, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

const SESSION_HEADER: &str = "mcp-session-id";

/// Tool server reached over HTTP, one JSON-RPC request per POST
pub struct HttpToolClient {
    client: reqwest::Client,
    url: String,
    session_id: Option<String>,
    next_id: AtomicU64,
    healthy: AtomicBool,
}

impl HttpToolClient {
    /// Connect and perform the `initialize` handshake.
    pub async fn connect(
        server_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let connect_failed = |message: String| ConnectionError::ConnectFailed {
            server_id: server_id.to_string(),
            message,
        };

        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| connect_failed(format!("invalid header '{}': {}", key, e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| connect_failed(format!("invalid header value for '{}': {}", key, e)))?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .timeout(timeout)
            .build()
            .map_err(|e| connect_failed(e.to_string()))?;

        let mut this = Self {
            client,
            url: url.to_string(),
            session_id: None,
            next_id: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        };

        let request = JsonRpcRequest::call(
            this.next_request_id(),
            "initialize",
            jsonrpc::initialize_params("chaintools"),
        );
        let response = this
            .client
            .post(&this.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| connect_failed(format!("HTTP request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(connect_failed(format!("initialize returned {}", response.status())));
        }
        this.session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| connect_failed(format!("invalid initialize response: {}", e)))?;
        body.into_result()
            .map_err(|e| connect_failed(e.to_string()))?;

        // notification responses carry no body worth reading
        this.post(&JsonRpcRequest::notification("notifications/initialized"))
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        debug!("Connected to HTTP tool server {} at {}", server_id, url);
        Ok(this)
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<reqwest::Response, ConnectionError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(session) = &self.session_id {
            builder = builder.header(SESSION_HEADER, session);
        }
        let response = builder.send().await.map_err(|e| {
            self.healthy.store(false, Ordering::Relaxed);
            ConnectionError::Transport(format!("HTTP request failed: {}", e))
        })?;
        if response.status().is_server_error() {
            self.healthy.store(false, Ordering::Relaxed);
        }
        if !response.status().is_success() {
            return Err(ConnectionError::Transport(format!(
                "{} returned {}",
                request.method,
                response.status()
            )));
        }
        Ok(response)
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<JsonRpcResponse, ConnectionError> {
        let request = JsonRpcRequest::call(self.next_request_id(), method, params);
        self.post(&request)
            .await?
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| ConnectionError::Transport(format!("Failed to read response: {}", e)))
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
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
        Ok(())
    }
}
