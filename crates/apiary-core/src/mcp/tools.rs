//! The tool catalogue and its dispatch into the hub.
//!
//! Tool failures are reported in-band (`isError: true` with a readable
//! message) so the coordinator model can react to them; JSON-RPC error
//! envelopes stay reserved for protocol violations.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::agent::{Agent, AgentRole, AgentSpecialty, SpawnOptions};
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::task::{Artifact, CreateTaskRequest, StepChange, StepSpec};

/// Result of one tool invocation, already flattened for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(payload: Value) -> Self {
        Self {
            text: serde_json::to_string_pretty(&payload)
                .unwrap_or_else(|_| "{}".to_string()),
            is_error: false,
        }
    }

    fn err(error: &HubError) -> Self {
        Self {
            text: json!({ "error": error.kind(), "message": error.to_string() }).to_string(),
            is_error: true,
        }
    }

    /// Render as the MCP `tools/call` result payload.
    pub fn into_result(self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.text }],
            "isError": self.is_error,
        })
    }
}

/// Static tool descriptors for `tools/list`.
pub fn catalog() -> Value {
    json!([
        {
            "name": "manage_agent",
            "description": "Spawn, start, stop, destroy, list or inspect fleet agents.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["spawn", "start", "stop", "destroy", "list", "get"] },
                    "agent_id": { "type": "string", "description": "Agent UUID (for start/stop/destroy/get)." },
                    "name": { "type": "string", "description": "Unique agent name (spawn) or lookup key (get)." },
                    "role": { "type": "string", "enum": ["queen", "worker"] },
                    "specialty": { "type": "string", "enum": ["front", "back", "infra", "fullstack"] },
                    "model": { "type": "string" },
                    "branch": { "type": "string" },
                    "ports": { "type": "array", "items": { "type": "integer" }, "description": "Required host ports to lease before spawn." },
                    "wait_for_ports": { "type": "boolean" }
                },
                "required": ["action"]
            }
        },
        {
            "name": "send_message",
            "description": "Send a human message to an agent's stdin.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "message": { "type": "string" }
                },
                "required": ["agent_id", "message"]
            }
        },
        {
            "name": "get_conversation",
            "description": "Read an agent's ordered conversation buffer.",
            "inputSchema": {
                "type": "object",
                "properties": { "agent_id": { "type": "string" } },
                "required": ["agent_id"]
            }
        },
        {
            "name": "manage_task",
            "description": "Create and drive step-wise tasks on agents.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["create", "start", "update_step", "complete", "fail", "cancel", "list", "get"] },
                    "task_id": { "type": "string" },
                    "agent_id": { "type": "string" },
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "context": { "type": "string" },
                    "required_ports": { "type": "array", "items": { "type": "integer" } },
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "action": { "type": "string" },
                                "description": { "type": "string" },
                                "dod": { "type": "array", "items": { "type": "string" } },
                                "autonomy": { "type": "string", "enum": ["full", "ask_if_unclear", "validate_before_next", "notify_when_done"] }
                            },
                            "required": ["action", "dod"]
                        }
                    },
                    "step_id": { "type": "integer" },
                    "status": { "type": "string", "enum": ["pending", "in_progress", "completed", "failed", "skipped", "waiting", "blocked"] },
                    "result": { "type": "string" },
                    "error": { "type": "string" },
                    "reason": { "type": "string" },
                    "artifacts": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "type": { "type": "string" },
                                "name": { "type": "string" },
                                "url": { "type": "string" }
                            },
                            "required": ["type", "name", "url"]
                        }
                    }
                },
                "required": ["action"]
            }
        },
        {
            "name": "respond_solicitation",
            "description": "Answer, dismiss or inspect pending agent solicitations.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["create", "respond", "dismiss", "list", "get"] },
                    "solicitation_id": { "type": "string" },
                    "agent_id": { "type": "string" },
                    "type": { "type": "string", "enum": ["question", "blocker", "ambiguity", "confirmation"] },
                    "urgency": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                    "message": { "type": "string" },
                    "context": { "type": "string" },
                    "response": { "type": "string" }
                },
                "required": ["action"]
            }
        },
        {
            "name": "manage_port",
            "description": "List port leases and waiters, or force-release a port.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["list", "force_release"] },
                    "port": { "description": "Port number, 1-65535. Accepted as integer or numeric string." }
                },
                "required": ["action"]
            }
        },
        {
            "name": "get_status",
            "description": "Point-in-time hub counters.",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

/// Dispatch one `tools/call` by name. Unknown tools and every hub error
/// come back in-band.
pub async fn call(hub: &Hub, name: &str, args: &Value) -> ToolOutcome {
    let result = match name {
        "manage_agent" => manage_agent(hub, args).await,
        "send_message" => send_message(hub, args).await,
        "get_conversation" => get_conversation(hub, args),
        "manage_task" => manage_task(hub, args),
        "respond_solicitation" => respond_solicitation(hub, args),
        "manage_port" => manage_port(hub, args),
        "get_status" => Ok(json!(hub.status())),
        other => Err(HubError::NotFound(format!("unknown tool {other:?}"))),
    };
    match result {
        Ok(payload) => ToolOutcome::ok(payload),
        Err(e) => ToolOutcome::err(&e),
    }
}

// ---------------------------------------------------------------------------
// Tool handlers
// ---------------------------------------------------------------------------

async fn manage_agent(hub: &Hub, args: &Value) -> Result<Value> {
    match str_arg(args, "action")? {
        "spawn" => {
            let name = str_arg(args, "name")?.to_string();
            let role: AgentRole = opt_str_arg(args, "role")
                .map(str::parse)
                .transpose()?
                .unwrap_or(AgentRole::Worker);
            let specialty: AgentSpecialty = opt_str_arg(args, "specialty")
                .map(str::parse)
                .transpose()?
                .unwrap_or(AgentSpecialty::Fullstack);
            let opts = SpawnOptions {
                name,
                role,
                specialty,
                model: opt_str_arg(args, "model").map(String::from),
                branch: opt_str_arg(args, "branch").map(String::from),
                required_ports: port_list_arg(args, "ports")?,
                wait_for_ports: args
                    .get("wait_for_ports")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                env: Default::default(),
            };
            let agent = hub.spawn_agent(opts).await?;
            Ok(json!(agent))
        }
        "start" => {
            let agent = resolve_agent(hub, args)?;
            Ok(json!(hub.restart_agent(agent.id).await?))
        }
        "stop" => {
            let agent = resolve_agent(hub, args)?;
            Ok(json!(hub.stop_agent(agent.id).await?))
        }
        "destroy" => {
            let agent = resolve_agent(hub, args)?;
            Ok(json!(hub.destroy_agent(agent.id).await?))
        }
        "list" => {
            let agents = hub.list_agents();
            Ok(json!({ "count": agents.len(), "agents": agents }))
        }
        "get" => Ok(json!(resolve_agent(hub, args)?)),
        other => Err(HubError::InvalidArgument(format!(
            "unknown manage_agent action {other:?}"
        ))),
    }
}

async fn send_message(hub: &Hub, args: &Value) -> Result<Value> {
    let agent_id = uuid_arg(args, "agent_id")?;
    let message = str_arg(args, "message")?;
    let stored = hub.send_message(agent_id, message).await?;
    Ok(json!({ "delivered": true, "seq": stored.seq, "timestamp": stored.timestamp }))
}

fn get_conversation(hub: &Hub, args: &Value) -> Result<Value> {
    let agent_id = uuid_arg(args, "agent_id")?;
    Ok(json!(hub.get_conversation(agent_id)?))
}

fn manage_task(hub: &Hub, args: &Value) -> Result<Value> {
    match str_arg(args, "action")? {
        "create" => {
            let steps = steps_arg(args)?;
            let req = CreateTaskRequest {
                agent_id: uuid_arg(args, "agent_id")?,
                title: opt_str_arg(args, "title").unwrap_or("").to_string(),
                description: opt_str_arg(args, "description").unwrap_or("").to_string(),
                context: opt_str_arg(args, "context").unwrap_or("").to_string(),
                required_ports: port_list_arg(args, "required_ports")?,
                steps,
            };
            Ok(json!(hub.create_task(req)?))
        }
        "start" => Ok(json!(hub.start_task(uuid_arg(args, "task_id")?)?)),
        "update_step" => {
            let task_id = uuid_arg(args, "task_id")?;
            let step_id = args
                .get("step_id")
                .and_then(Value::as_u64)
                .ok_or_else(|| HubError::InvalidArgument("step_id must be an integer".into()))?
                as u32;
            let status = str_arg(args, "status")?.parse()?;
            let change = StepChange {
                status,
                result: opt_str_arg(args, "result").map(String::from),
                error: opt_str_arg(args, "error").map(String::from),
            };
            Ok(json!(hub.update_task_step(task_id, step_id, change)?))
        }
        "complete" => {
            let task_id = uuid_arg(args, "task_id")?;
            let artifacts = artifacts_arg(args)?;
            let result = opt_str_arg(args, "result").map(String::from);
            Ok(json!(hub.complete_task(task_id, result, artifacts)?))
        }
        "fail" => {
            let task_id = uuid_arg(args, "task_id")?;
            let error = str_arg(args, "error")?;
            Ok(json!(hub.fail_task(task_id, error)?))
        }
        "cancel" => {
            let task_id = uuid_arg(args, "task_id")?;
            let reason = opt_str_arg(args, "reason").unwrap_or("cancelled by coordinator");
            Ok(json!(hub.cancel_task(task_id, reason)?))
        }
        "list" => {
            let tasks = hub.list_tasks();
            Ok(json!({ "count": tasks.len(), "tasks": tasks }))
        }
        "get" => {
            if let Some(task_id) = args.get("task_id") {
                let task_id = parse_uuid(task_id, "task_id")?;
                return Ok(json!(hub.get_task(task_id)?));
            }
            let agent_id = uuid_arg(args, "agent_id")?;
            let task = hub.task_for_agent(agent_id).ok_or_else(|| {
                HubError::NotFound(format!("no active task for agent {agent_id}"))
            })?;
            Ok(json!(task))
        }
        other => Err(HubError::InvalidArgument(format!(
            "unknown manage_task action {other:?}"
        ))),
    }
}

fn respond_solicitation(hub: &Hub, args: &Value) -> Result<Value> {
    match str_arg(args, "action")? {
        "create" => {
            let agent_id = uuid_arg(args, "agent_id")?;
            let kind = str_arg(args, "type")?.parse()?;
            let urgency = opt_str_arg(args, "urgency")
                .map(str::parse)
                .transpose()?
                .unwrap_or_default();
            let message = str_arg(args, "message")?.to_string();
            let context = opt_str_arg(args, "context").map(String::from);
            Ok(json!(hub.create_solicitation(agent_id, kind, urgency, message, context)?))
        }
        "respond" => {
            let id = uuid_arg(args, "solicitation_id")?;
            let response = str_arg(args, "response")?;
            Ok(json!(hub.respond_solicitation(id, response)?))
        }
        "dismiss" => {
            let id = uuid_arg(args, "solicitation_id")?;
            Ok(json!(hub.dismiss_solicitation(id)?))
        }
        "list" => {
            let agent_id = match args.get("agent_id") {
                Some(v) => Some(parse_uuid(v, "agent_id")?),
                None => None,
            };
            let pending = hub.list_pending_solicitations(agent_id);
            Ok(json!({ "count": pending.len(), "solicitations": pending }))
        }
        "get" => {
            let id = uuid_arg(args, "solicitation_id")?;
            Ok(json!(hub.get_solicitation(id)?))
        }
        other => Err(HubError::InvalidArgument(format!(
            "unknown respond_solicitation action {other:?}"
        ))),
    }
}

fn manage_port(hub: &Hub, args: &Value) -> Result<Value> {
    match str_arg(args, "action")? {
        "list" => Ok(json!({
            "leases": hub.list_ports(),
            "waiters": hub.list_port_waiters(),
        })),
        "force_release" => {
            let port = port_arg(args, "port")?;
            hub.force_release_port(port)?;
            Ok(json!({ "released": port }))
        }
        other => Err(HubError::InvalidArgument(format!(
            "unknown manage_port action {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Argument extraction
// ---------------------------------------------------------------------------

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::InvalidArgument(format!("missing or non-string {key:?}")))
}

fn opt_str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn parse_uuid(value: &Value, key: &str) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| HubError::InvalidArgument(format!("{key} must be a UUID")))
}

fn uuid_arg(args: &Value, key: &str) -> Result<Uuid> {
    let value = args
        .get(key)
        .ok_or_else(|| HubError::InvalidArgument(format!("missing {key:?}")))?;
    parse_uuid(value, key)
}

/// Accept a port as a JSON number or a numeric string; enforce 1-65535.
fn port_arg(args: &Value, key: &str) -> Result<u16> {
    let value = args
        .get(key)
        .ok_or_else(|| HubError::InvalidArgument(format!("missing {key:?}")))?;
    let n = match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| HubError::InvalidArgument(format!("{key} must be a positive integer")))?,
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| {
            HubError::InvalidArgument(format!("{key} {s:?} is not a number"))
        })?,
        _ => {
            return Err(HubError::InvalidArgument(format!(
                "{key} must be a number or numeric string"
            )));
        }
    };
    if !(1..=65_535).contains(&n) {
        return Err(HubError::InvalidArgument(format!(
            "{key} {n} is out of range 1-65535"
        )));
    }
    Ok(n as u16)
}

fn port_list_arg(args: &Value, key: &str) -> Result<Vec<u16>> {
    let Some(value) = args.get(key) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| HubError::InvalidArgument(format!("{key} must be an array")))?;
    items
        .iter()
        .map(|item| {
            let n = item.as_u64().ok_or_else(|| {
                HubError::InvalidArgument(format!("{key} entries must be integers"))
            })?;
            if !(1..=65_535).contains(&n) {
                return Err(HubError::InvalidArgument(format!(
                    "{key} entry {n} is out of range 1-65535"
                )));
            }
            Ok(n as u16)
        })
        .collect()
}

fn steps_arg(args: &Value) -> Result<Vec<StepSpec>> {
    let Some(value) = args.get("steps") else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| HubError::InvalidArgument("steps must be an array".into()))?;
    items
        .iter()
        .map(|item| {
            let autonomy = item
                .get("autonomy")
                .and_then(Value::as_str)
                .map(str::parse)
                .transpose()?;
            Ok(StepSpec {
                action: item
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                description: item
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                dod: item
                    .get("dod")
                    .and_then(Value::as_array)
                    .map(|bullets| {
                        bullets
                            .iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
                autonomy,
            })
        })
        .collect()
}

fn artifacts_arg(args: &Value) -> Result<Vec<Artifact>> {
    let Some(value) = args.get("artifacts") else {
        return Ok(Vec::new());
    };
    serde_json::from_value(value.clone())
        .map_err(|e| HubError::InvalidArgument(format!("invalid artifacts: {e}")))
}

/// Resolve an agent from `agent_id` or `name`.
fn resolve_agent(hub: &Hub, args: &Value) -> Result<Agent> {
    if let Some(value) = args.get("agent_id") {
        return hub.get_agent(parse_uuid(value, "agent_id")?);
    }
    if let Some(name) = opt_str_arg(args, "name") {
        return hub
            .find_agent_by_name(name)
            .ok_or_else(|| HubError::NotFound(format!("agent named {name:?}")));
    }
    Err(HubError::InvalidArgument(
        "agent_id or name is required".into(),
    ))
}
