//! Line-delimited JSON-RPC loop: one request per line in, one response per
//! line out. Notifications get no response.

use lib_streamops::retrieve::StreamOpsApi;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::*;
use super::tools::{self, CATALOG};

pub struct McpServer {
    api: StreamOpsApi,
    info: ServerInfo,
}

impl McpServer {
    pub fn new(api: StreamOpsApi) -> Self {
        Self {
            api,
            info: ServerInfo {
                name: "streamops".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Serves until `input` reaches EOF.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                let mut text = serde_json::to_string(&response)?;
                text.push('\n');
                output.write_all(text.as_bytes()).await?;
                output.flush().await?;
            }
        }
        tracing::info!("stdin closed, shutting down");
        Ok(())
    }

    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Unparseable request: {}", e);
                return Some(JsonRpcResponse::failure(Value::Null, JsonRpcError::parse_error(e)));
            }
        };
        let id_hint = raw.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(raw) {
            Ok(r) => r,
            Err(e) => {
                return Some(JsonRpcResponse::failure(
                    id_hint,
                    JsonRpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e)),
                ));
            }
        };

        if request.is_notification() {
            tracing::debug!("Notification {} ignored", request.method);
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        Some(match self.dispatch(&request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        match request.method.as_str() {
            "initialize" => to_value(&InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: ToolsCapability { list_changed: false },
                },
                server_info: self.info.clone(),
            }),
            "ping" => Ok(json!({})),
            "tools/list" => to_value(&ListToolsResult {
                tools: CATALOG.iter().map(|t| t.to_tool()).collect(),
            }),
            "tools/call" => {
                let params: CallToolParams = request
                    .params
                    .clone()
                    .ok_or_else(|| JsonRpcError::invalid_params("missing params"))
                    .and_then(|p| {
                        serde_json::from_value(p).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
                    })?;
                to_value(&self.call_tool(&params).await?)
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    /// Argument problems are protocol errors; API failures are tool results
    /// with `isError` set.
    async fn call_tool(&self, params: &CallToolParams) -> Result<CallToolResult, JsonRpcError> {
        let tool = tools::find(&params.name)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)))?;
        let call = tool
            .resolve(params.arguments.as_ref())
            .map_err(JsonRpcError::invalid_params)?;

        tracing::info!("tools/call {} -> {} /{}", tool.name, call.method, call.segments.join("/"));
        let result = self
            .api
            .call(call.method.clone(), &call.segments(), &call.query(), call.body.as_ref())
            .await;
        Ok(match result {
            Ok(Value::Null) => CallToolResult::text("OK"),
            Ok(value) => CallToolResult::text(
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
            ),
            Err(e) => {
                tracing::warn!("Tool {} failed: {}", tool.name, e);
                CallToolResult::error(e.to_string())
            }
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))
}
