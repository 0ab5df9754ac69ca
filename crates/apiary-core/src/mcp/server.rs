//! The MCP server loop.
//!
//! Reads newline-delimited JSON-RPC from an inbound byte stream, routes
//! requests into the hub, and writes replies to the outbound stream,
//! flushing after every line. Runs until EOF or cancellation. Strictness
//! rules:
//!
//! - unparseable line        -> `-32700` with `id: null`
//! - valid JSON, not a call  -> `-32600`
//! - call before `initialize`-> `-32600`
//! - unknown method          -> `-32601`
//! - malformed params        -> `-32602`
//! - handler failure         -> `-32603`
//! - notification (no id)    -> never answered

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    self, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, Incoming, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION, RpcError,
};
use super::tools;
use crate::hub::Hub;

/// Name reported in `serverInfo`.
const SERVER_NAME: &str = "apiary-hub";

/// JSON-RPC server bound to one outbound stream.
pub struct McpServer<W> {
    hub: Arc<Hub>,
    writer: W,
    initialized: bool,
}

impl<W: AsyncWrite + Unpin> McpServer<W> {
    pub fn new(hub: Arc<Hub>, writer: W) -> Self {
        Self {
            hub,
            writer,
            initialized: false,
        }
    }

    /// Serve until the reader hits EOF or `cancel` fires.
    pub async fn run<R>(mut self, reader: R, cancel: CancellationToken) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("mcp server cancelled");
                    break;
                }
                line = lines.next_line() => {
                    match line? {
                        None => {
                            tracing::debug!("mcp inbound stream closed (EOF)");
                            break;
                        }
                        Some(line) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            self.handle_line(&line).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> std::io::Result<()> {
        let incoming = match protocol::decode(line) {
            Ok(incoming) => incoming,
            Err(()) => {
                let envelope = protocol::error_response(
                    &Value::Null,
                    RpcError::new(PARSE_ERROR, "parse error"),
                );
                return self.write_json(&envelope).await;
            }
        };

        match incoming {
            Incoming::Request { id, method, params } => {
                let reply = self.handle_request(&method, params).await;
                let envelope = match reply {
                    Ok(result) => protocol::response(&id, result),
                    Err(error) => protocol::error_response(&id, error),
                };
                self.write_json(&envelope).await
            }
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params);
                Ok(())
            }
            Incoming::Response => Ok(()),
            Incoming::Invalid => {
                let envelope = protocol::error_response(
                    &Value::Null,
                    RpcError::new(INVALID_REQUEST, "not a JSON-RPC request"),
                );
                self.write_json(&envelope).await
            }
        }
    }

    async fn handle_request(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        if method == "initialize" {
            self.initialized = true;
            return Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                    "resources": {},
                    "prompts": {},
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }));
        }
        if method == "ping" {
            return Ok(json!({}));
        }
        if !self.initialized {
            return Err(RpcError::new(
                INVALID_REQUEST,
                "initialize must be called first",
            ));
        }

        match method {
            "tools/list" => Ok(json!({ "tools": tools::catalog() })),
            "tools/call" => self.handle_tool_call(params).await,
            "resources/list" => Ok(resources_list()),
            "resources/read" => self.handle_resource_read(&params),
            "prompts/list" => Ok(prompts_list()),
            "prompts/get" => handle_prompt_get(&params),
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown method {other:?}"),
            )),
        }
    }

    async fn handle_tool_call(&self, params: Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "params.name must be a string"))?;
        let default_args = json!({});
        let arguments = match params.get("arguments") {
            None => &default_args,
            Some(value) if value.is_object() => value,
            Some(_) => {
                return Err(RpcError::new(
                    INVALID_PARAMS,
                    "params.arguments must be an object",
                ));
            }
        };

        let outcome = tools::call(&self.hub, name, arguments).await;
        Ok(outcome.into_result())
    }

    fn handle_resource_read(&self, params: &Value) -> Result<Value, RpcError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "params.uri must be a string"))?;

        let payload = match uri {
            "hub://status" => json!(self.hub.status()),
            "hub://agents" => json!(self.hub.list_agents()),
            "hub://solicitations" => json!(self.hub.list_pending_solicitations(None)),
            other => {
                return Err(RpcError::new(
                    INVALID_PARAMS,
                    format!("unknown resource {other:?}"),
                ));
            }
        };

        let text = serde_json::to_string_pretty(&payload)
            .map_err(|e| RpcError::new(INTERNAL_ERROR, format!("serialization failed: {e}")))?;
        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": text,
            }]
        }))
    }

    fn handle_notification(&mut self, method: &str, params: Value) {
        match method {
            "notifications/initialized" => {
                tracing::debug!("client reported initialized");
            }
            "notifications/cancelled" => {
                // Best-effort: tool calls run to completion synchronously,
                // so there is nothing in flight to abort.
                let request_id = params.get("requestId").cloned().unwrap_or(Value::Null);
                tracing::debug!(?request_id, "cancellation noted");
            }
            other => {
                tracing::debug!(method = other, "ignoring unknown notification");
            }
        }
    }

    async fn write_json(&mut self, value: &Value) -> std::io::Result<()> {
        let line = serde_json::to_string(value)
            .map_err(|e| std::io::Error::other(format!("serialize reply: {e}")))?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

// ---------------------------------------------------------------------------
// Resources & prompts
// ---------------------------------------------------------------------------

fn resources_list() -> Value {
    json!({
        "resources": [
            {
                "uri": "hub://status",
                "name": "Hub status",
                "description": "Point-in-time fleet counters.",
                "mimeType": "application/json",
            },
            {
                "uri": "hub://agents",
                "name": "Agents",
                "description": "Every agent record, including destroyed ones.",
                "mimeType": "application/json",
            },
            {
                "uri": "hub://solicitations",
                "name": "Pending solicitations",
                "description": "Unanswered agent questions in FIFO order.",
                "mimeType": "application/json",
            },
        ]
    })
}

struct PromptSpec {
    name: &'static str,
    description: &'static str,
    arguments: &'static [(&'static str, &'static str, bool)],
    template: &'static str,
}

const PROMPTS: &[PromptSpec] = &[
    PromptSpec {
        name: "assign_task",
        description: "Brief a drone on a freshly created task.",
        arguments: &[
            ("agent_name", "Name of the drone receiving the task", true),
            ("title", "Task title", true),
            ("context", "Extra context for the drone", false),
        ],
        template: "You are {agent_name}. A new task has been assigned to you: \
                   {title}. Work through the steps in order and report progress \
                   after each one. Context: {context}",
    },
    PromptSpec {
        name: "triage_solicitation",
        description: "Ask the operator to settle a pending solicitation.",
        arguments: &[
            ("agent_name", "Drone that raised the solicitation", true),
            ("message", "The solicitation text", true),
        ],
        template: "{agent_name} is blocked and asks: {message}. Decide and \
                   respond so the drone can continue.",
    },
];

fn prompts_list() -> Value {
    let prompts: Vec<Value> = PROMPTS
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "description": p.description,
                "arguments": p.arguments.iter().map(|(name, description, required)| {
                    json!({ "name": name, "description": description, "required": required })
                }).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "prompts": prompts })
}

fn handle_prompt_get(params: &Value) -> Result<Value, RpcError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "params.name must be a string"))?;
    let prompt = PROMPTS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("unknown prompt {name:?}")))?;

    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
    let mut text = prompt.template.to_string();
    for (arg_name, _, required) in prompt.arguments {
        let placeholder = format!("{{{arg_name}}}");
        match arguments.get(*arg_name).and_then(Value::as_str) {
            Some(value) => text = text.replace(&placeholder, value),
            None if *required => {
                return Err(RpcError::new(
                    INVALID_PARAMS,
                    format!("missing required argument {arg_name:?}"),
                ));
            }
            None => text = text.replace(&placeholder, ""),
        }
    }

    Ok(json!({
        "description": prompt.description,
        "messages": [{
            "role": "user",
            "content": { "type": "text", "text": text },
        }],
    }))
}
