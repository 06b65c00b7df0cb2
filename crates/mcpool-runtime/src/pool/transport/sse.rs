//! HTTP/SSE transport for remote providers
//!
//! Endpoints, relative to the configured base URL:
//! - `GET /ping` health
//! - `GET /tools`, falling back to `/tools/list`
//! - `POST /call`, falling back to `/tools/call`

use std::time::Duration;

use async_trait::async_trait;
use mcpool_core::{ClientType, McpConfig, PoolError, PoolResult, TimeoutPhase, Tool, TransportSettings};
use mcpool_mcp::extract_tool_listing;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectedSession, McpConnection, TransportConnector};

/// Base URL of a connected provider plus its heartbeat task.
pub struct SseHandle {
    base_url: String,
    cancel: CancellationToken,
    heartbeat: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SseHandle {
    /// Handle without a heartbeat; trailing slashes are dropped from `url`.
    pub fn new(url: &str) -> Self {
        Self {
            base_url: url.trim().trim_end_matches('/').to_string(),
            cancel: CancellationToken::new(),
            heartbeat: parking_lot::Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the heartbeat. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
    }

    /// A zero interval disables the heartbeat.
    fn start_heartbeat(&self, client: Client, every: Duration, ping_timeout: Duration) {
        if every.is_zero() {
            debug!(url = %self.base_url, "[SseConnector] Heartbeat disabled");
            return;
        }
        let cancel = self.cancel.clone();
        let url = self.endpoint("/ping");
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match ping(&client, &url, ping_timeout).await {
                            Ok(()) => debug!(url = %url, "[SseConnector] Heartbeat ok"),
                            Err(e) => warn!(url = %url, error = %e, "[SseConnector] Heartbeat failed"),
                        }
                    }
                }
            }
        });
        *self.heartbeat.lock() = Some(task);
    }
}

impl Drop for SseHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn ping(client: &Client, url: &str, limit: Duration) -> PoolResult<()> {
    let response = client
        .get(url)
        .timeout(limit)
        .send()
        .await
        .map_err(|e| PoolError::TransportUnavailable(format!("{} unreachable: {}", url, e)))?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(PoolError::TransportUnavailable(format!(
            "{} answered {}",
            url,
            response.status()
        )))
    }
}

fn falls_back(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::METHOD_NOT_ALLOWED
}

async fn read_json(response: Response) -> PoolResult<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PoolError::MalformedResponse(format!("cannot read body: {}", e)))?;
    serde_json::from_str(&body).map_err(|_| {
        let preview: String = body.chars().take(200).collect();
        PoolError::MalformedResponse(format!("non-JSON body ({}): {}", status, preview))
    })
}

pub struct SseConnector {
    client: Client,
    settings: TransportSettings,
}

impl SseConnector {
    pub fn new(settings: TransportSettings) -> Self {
        let client = Client::builder()
            .user_agent(concat!("mcpool/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, settings }
    }

    fn parse_base(url: &str) -> PoolResult<String> {
        let trimmed = url.trim().trim_end_matches('/');
        let parsed = url::Url::parse(trimmed)
            .map_err(|e| PoolError::config(format!("invalid SSE url '{}': {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(trimmed.to_string()),
            other => Err(PoolError::config(format!(
                "unsupported SSE url scheme '{}' in '{}'",
                other, url
            ))),
        }
    }

    async fn fetch_tools(&self, handle: &SseHandle) -> PoolResult<Vec<Tool>> {
        let limit = self.settings.sse_discovery_timeout;
        let mut response = self.get(&handle.endpoint("/tools"), limit).await?;
        if falls_back(response.status()) {
            debug!(url = handle.base_url(), "[SseConnector] /tools missing, trying /tools/list");
            response = self.get(&handle.endpoint("/tools/list"), limit).await?;
        }
        if !response.status().is_success() {
            return Err(PoolError::TransportUnavailable(format!(
                "tool listing at {} answered {}",
                handle.base_url(),
                response.status()
            )));
        }

        let body = read_json(response).await?;
        if let Some(tools) = extract_tool_listing(&body) {
            return Ok(tools);
        }
        match body {
            Value::Array(items) => Ok(items.iter().filter_map(Tool::from_value).collect()),
            other => Err(PoolError::MalformedResponse(format!(
                "unrecognized tool listing: {}",
                other
            ))),
        }
    }

    async fn get(&self, url: &str, limit: Duration) -> PoolResult<Response> {
        self.client
            .get(url)
            .timeout(limit)
            .send()
            .await
            .map_err(|e| request_error(e, TimeoutPhase::Discovery, limit))
    }

    async fn post(&self, url: &str, body: &Value, limit: Duration) -> PoolResult<Response> {
        self.client
            .post(url)
            .json(body)
            .timeout(limit)
            .send()
            .await
            .map_err(|e| request_error(e, TimeoutPhase::ToolCall, limit))
    }
}

fn request_error(e: reqwest::Error, phase: TimeoutPhase, limit: Duration) -> PoolError {
    if e.is_timeout() {
        PoolError::timeout(phase, limit)
    } else {
        PoolError::TransportUnavailable(e.to_string())
    }
}

#[async_trait]
impl TransportConnector for SseConnector {
    fn client_type(&self) -> ClientType {
        ClientType::Sse
    }

    async fn connect(&self, instance_id: &str, config: &McpConfig) -> PoolResult<ConnectedSession> {
        let cfg = config
            .as_sse()
            .ok_or_else(|| PoolError::config("sse connector requires an sse config"))?;
        config.validate()?;
        let base_url = Self::parse_base(&cfg.url)?;
        let handle = SseHandle::new(&base_url);

        info!(instance_id, url = %base_url, "[SseConnector] Connecting");
        ping(&self.client, &handle.endpoint("/ping"), self.settings.sse_ping_timeout).await?;

        let tools = self.fetch_tools(&handle).await?;
        handle.start_heartbeat(
            self.client.clone(),
            self.settings.heartbeat_interval,
            self.settings.sse_ping_timeout,
        );

        info!(
            instance_id,
            url = %base_url,
            tool_count = tools.len(),
            "[SseConnector] Connected"
        );
        Ok(ConnectedSession {
            connection: McpConnection::Sse(std::sync::Arc::new(handle)),
            tools,
        })
    }

    async fn call_tool(
        &self,
        connection: &McpConnection,
        tool_name: &str,
        params: Value,
    ) -> PoolResult<Value> {
        let handle = connection.as_sse()?;
        if handle.is_stopped() {
            return Err(PoolError::TransportUnavailable(format!(
                "{} is disconnected",
                handle.base_url()
            )));
        }

        let limit = self.settings.sse_call_timeout;
        let body = json!({
            "name": tool_name,
            "tool": tool_name,
            "arguments": params,
            "params": params,
        });

        debug!(url = handle.base_url(), tool = tool_name, "[SseConnector] Calling tool");
        let mut response = self.post(&handle.endpoint("/call"), &body, limit).await?;
        if falls_back(response.status()) {
            response = self.post(&handle.endpoint("/tools/call"), &body, limit).await?;
        }

        let status = response.status();
        let reply = read_json(response).await?;
        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| error.as_str().map(str::to_string))
                .unwrap_or_else(|| error.to_string());
            return Err(PoolError::Protocol(message));
        }
        match reply.get("result") {
            Some(result) => Ok(result.clone()),
            None if !status.is_success() => Err(PoolError::TransportUnavailable(format!(
                "{} answered {}",
                handle.base_url(),
                status
            ))),
            None => Err(PoolError::MalformedResponse(format!(
                "reply has neither result nor error: {}",
                reply
            ))),
        }
    }

    async fn disconnect(&self, connection: &McpConnection) -> PoolResult<()> {
        let handle = connection.as_sse()?;
        handle.stop();
        debug!(url = handle.base_url(), "[SseConnector] Heartbeat stopped");
        Ok(())
    }

    async fn check_connection(&self, connection: &McpConnection) -> bool {
        match connection.as_sse() {
            Ok(handle) => ping(
                &self.client,
                &handle.endpoint("/ping"),
                self.settings.sse_ping_timeout,
            )
            .await
            .is_ok(),
            Err(_) => false,
        }
    }
}
