//! MCP server protocol tests over an in-memory transport.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use apiary_core::mcp::McpServer;
use apiary_test_utils::{TestHub, test_hub};

// ---------------------------------------------------------------------------
// Test client
// ---------------------------------------------------------------------------

struct McpClient {
    writer: WriteHalf<tokio::io::DuplexStream>,
    lines: tokio::io::Lines<BufReader<ReadHalf<tokio::io::DuplexStream>>>,
    server: JoinHandle<std::io::Result<()>>,
    cancel: CancellationToken,
    next_id: i64,
    _hub: TestHub,
}

impl McpClient {
    /// Boot a hub on fakes and connect a client over a duplex pipe.
    fn connect() -> Self {
        let t = test_hub();
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let (server_reader, server_writer) = tokio::io::split(server_end);
        let (client_reader, client_writer) = tokio::io::split(client_end);

        let cancel = CancellationToken::new();
        let server = McpServer::new(t.hub.clone(), server_writer);
        let server = tokio::spawn(server.run(BufReader::new(server_reader), cancel.clone()));

        Self {
            writer: client_writer,
            lines: BufReader::new(client_reader).lines(),
            server,
            cancel,
            next_id: 0,
            _hub: t,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for a reply")
            .unwrap()
            .expect("server closed the stream");
        serde_json::from_str(&line).expect("reply should be JSON")
    }

    /// Send a request and read its reply.
    async fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.send_raw(
            &json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string(),
        )
        .await;
        let reply = self.recv().await;
        assert_eq!(reply["id"], id, "reply must echo the request id");
        reply
    }

    async fn initialize(&mut self) -> Value {
        self.request("initialize", json!({})).await
    }

    /// Call a tool and return the decoded in-band payload.
    async fn call_tool(&mut self, name: &str, arguments: Value) -> (Value, bool) {
        let reply = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await;
        let result = &reply["result"];
        let is_error = result["isError"].as_bool().unwrap_or(false);
        let text = result["content"][0]["text"].as_str().expect("text content");
        (serde_json::from_str(text).expect("payload should be JSON"), is_error)
    }
}

// ---------------------------------------------------------------------------
// Protocol strictness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parse_error_replies_with_null_id() {
    let mut client = McpClient::connect();
    client.send_raw("{this is not json").await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["error"]["code"], -32700);
}

#[tokio::test]
async fn calls_before_initialize_are_rejected() {
    let mut client = McpClient::connect();
    let reply = client.request("tools/list", json!({})).await;
    assert_eq!(reply["error"]["code"], -32600);

    client.initialize().await;
    let reply = client.request("tools/list", json!({})).await;
    assert!(reply["error"].is_null());
}

#[tokio::test]
async fn initialize_reports_protocol_and_capabilities() {
    let mut client = McpClient::connect();
    let reply = client.initialize().await;
    let result = &reply["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert!(result["capabilities"].get("tools").is_some());
    assert!(result["capabilities"].get("resources").is_some());
    assert!(result["capabilities"].get("prompts").is_some());
    assert_eq!(result["serverInfo"]["name"], "apiary-hub");
}

#[tokio::test]
async fn notifications_never_produce_output() {
    let mut client = McpClient::connect();
    client.initialize().await;

    // Neither a null-id request nor a proper notification may be answered.
    client
        .send_raw(r#"{"jsonrpc":"2.0","id":null,"method":"tools/list"}"#)
        .await;
    client
        .send_raw(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await;
    client
        .send_raw(r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":1}}"#)
        .await;

    // The next reply on the wire belongs to this ping, proving the three
    // frames above were silently consumed.
    let reply = client.request("ping", json!({})).await;
    assert!(reply["error"].is_null());
}

#[tokio::test]
async fn unknown_method_is_32601() {
    let mut client = McpClient::connect();
    client.initialize().await;
    let reply = client.request("tools/destroy_everything", json!({})).await;
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn malformed_tool_params_are_32602() {
    let mut client = McpClient::connect();
    client.initialize().await;

    let reply = client.request("tools/call", json!({ "no_name": true })).await;
    assert_eq!(reply["error"]["code"], -32602);

    let reply = client
        .request("tools/call", json!({ "name": "get_status", "arguments": [1, 2] }))
        .await;
    assert_eq!(reply["error"]["code"], -32602);
}

#[tokio::test]
async fn tools_list_is_idempotent() {
    let mut client = McpClient::connect();
    client.initialize().await;
    let first = client.request("tools/list", json!({})).await;
    let second = client.request("tools/list", json!({})).await;
    assert_eq!(first["result"], second["result"]);
    let names: Vec<&str> = first["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"manage_agent"));
    assert!(names.contains(&"get_status"));
}

#[tokio::test]
async fn eof_shuts_the_server_down() {
    let mut client = McpClient::connect();
    client.initialize().await;
    // Dropping the write half closes the inbound stream.
    drop(client.writer);
    let result = tokio::time::timeout(Duration::from_secs(2), client.server)
        .await
        .expect("server should exit on EOF")
        .unwrap();
    assert!(result.is_ok());
    client.cancel.cancel();
}

// ---------------------------------------------------------------------------
// Resources and prompts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resources_roundtrip() {
    let mut client = McpClient::connect();
    client.initialize().await;

    let reply = client.request("resources/list", json!({})).await;
    let uris: Vec<&str> = reply["result"]["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap())
        .collect();
    assert_eq!(uris, vec!["hub://status", "hub://agents", "hub://solicitations"]);

    let reply = client
        .request("resources/read", json!({ "uri": "hub://status" }))
        .await;
    let text = reply["result"]["contents"][0]["text"].as_str().unwrap();
    let status: Value = serde_json::from_str(text).unwrap();
    assert_eq!(status["agents_total"], 0);

    let reply = client
        .request("resources/read", json!({ "uri": "hub://nope" }))
        .await;
    assert_eq!(reply["error"]["code"], -32602);
}

#[tokio::test]
async fn prompts_substitute_arguments() {
    let mut client = McpClient::connect();
    client.initialize().await;

    let reply = client.request("prompts/list", json!({})).await;
    assert!(!reply["result"]["prompts"].as_array().unwrap().is_empty());

    let reply = client
        .request(
            "prompts/get",
            json!({
                "name": "assign_task",
                "arguments": { "agent_name": "drone-9", "title": "Ship it" },
            }),
        )
        .await;
    let text = reply["result"]["messages"][0]["content"]["text"]
        .as_str()
        .unwrap();
    assert!(text.contains("drone-9"));
    assert!(text.contains("Ship it"));
}

// ---------------------------------------------------------------------------
// End-to-end tool scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_and_drive_task_happy_path() {
    let mut client = McpClient::connect();
    client.initialize().await;

    // Spawn.
    let (agent, is_error) = client
        .call_tool(
            "manage_agent",
            json!({ "action": "spawn", "name": "drone-1", "specialty": "back", "model": "sonnet" }),
        )
        .await;
    assert!(!is_error, "spawn failed: {agent}");
    assert_eq!(agent["status"], "running");
    assert_eq!(agent["model"], "sonnet");
    let agent_id = agent["id"].as_str().unwrap().to_string();

    // Create a one-step task.
    let (task, is_error) = client
        .call_tool(
            "manage_task",
            json!({
                "action": "create",
                "agent_id": agent_id,
                "title": "X",
                "steps": [{ "action": "A", "dod": ["A-done"] }],
            }),
        )
        .await;
    assert!(!is_error, "create failed: {task}");
    assert_eq!(task["status"], "assigned");
    let task_id = task["id"].as_str().unwrap().to_string();

    // Start it.
    let (task, is_error) = client
        .call_tool("manage_task", json!({ "action": "start", "task_id": task_id }))
        .await;
    assert!(!is_error);
    assert_eq!(task["status"], "in_progress");
    assert_eq!(task["current_step"], 1);

    // Complete it.
    let (task, is_error) = client
        .call_tool(
            "manage_task",
            json!({ "action": "complete", "task_id": task_id, "result": "ok" }),
        )
        .await;
    assert!(!is_error);
    assert_eq!(task["status"], "completed");
    assert_eq!(task["result"], "ok");

    // Status reflects the fleet.
    let (status, _) = client.call_tool("get_status", json!({})).await;
    assert_eq!(status["agents_total"], 1);
    assert_eq!(status["agents_running"], 1);
    assert_eq!(status["tasks_total"], 1);
}

#[tokio::test]
async fn invalid_task_reports_in_band_error() {
    let mut client = McpClient::connect();
    client.initialize().await;

    let (agent, _) = client
        .call_tool("manage_agent", json!({ "action": "spawn", "name": "drone-1" }))
        .await;
    let agent_id = agent["id"].as_str().unwrap();

    let (payload, is_error) = client
        .call_tool(
            "manage_task",
            json!({ "action": "create", "agent_id": agent_id, "title": "", "steps": [] }),
        )
        .await;
    assert!(is_error);
    let message = payload["message"].as_str().unwrap();
    assert!(
        message.contains("title") || message.contains("steps"),
        "unhelpful message: {message}"
    );
}

#[tokio::test]
async fn port_conflict_then_release_then_grant() {
    let mut client = McpClient::connect();
    client.initialize().await;

    let (_, is_error) = client
        .call_tool(
            "manage_agent",
            json!({ "action": "spawn", "name": "a", "ports": [3000] }),
        )
        .await;
    assert!(!is_error);

    // Second agent wanting 3000 without waiting: conflict, in-band.
    let (payload, is_error) = client
        .call_tool(
            "manage_agent",
            json!({ "action": "spawn", "name": "b", "ports": [3000] }),
        )
        .await;
    assert!(is_error);
    assert_eq!(payload["error"], "conflict");

    // Force-release (port given as a string), then the lease succeeds.
    let (released, is_error) = client
        .call_tool("manage_port", json!({ "action": "force_release", "port": "3000" }))
        .await;
    assert!(!is_error);
    assert_eq!(released["released"], 3000);

    let (agent, is_error) = client
        .call_tool(
            "manage_agent",
            json!({ "action": "spawn", "name": "b", "ports": [3000] }),
        )
        .await;
    assert!(!is_error, "spawn after release failed: {agent}");
}

#[tokio::test]
async fn out_of_range_port_is_in_band_error() {
    let mut client = McpClient::connect();
    client.initialize().await;

    let (payload, is_error) = client
        .call_tool("manage_port", json!({ "action": "force_release", "port": "70000" }))
        .await;
    assert!(is_error);
    assert_eq!(payload["error"], "invalid_argument");
}

#[tokio::test]
async fn solicitation_flow_over_tools() {
    let mut client = McpClient::connect();
    client.initialize().await;

    let (agent, _) = client
        .call_tool("manage_agent", json!({ "action": "spawn", "name": "drone-1" }))
        .await;
    let agent_id = agent["id"].as_str().unwrap().to_string();

    let (solicitation, is_error) = client
        .call_tool(
            "respond_solicitation",
            json!({
                "action": "create",
                "agent_id": agent_id,
                "type": "question",
                "urgency": "high",
                "message": "?",
            }),
        )
        .await;
    assert!(!is_error);
    let sid = solicitation["id"].as_str().unwrap().to_string();

    // Listed while pending.
    let (listing, _) = client
        .call_tool("respond_solicitation", json!({ "action": "list" }))
        .await;
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["solicitations"][0]["id"], sid.as_str());

    // Respond resolves it.
    let (resolved, is_error) = client
        .call_tool(
            "respond_solicitation",
            json!({ "action": "respond", "solicitation_id": sid, "response": "answer" }),
        )
        .await;
    assert!(!is_error);
    assert_eq!(resolved["status"], "responded");
    assert_eq!(resolved["response"], "answer");

    // A second respond is already-resolved.
    let (payload, is_error) = client
        .call_tool(
            "respond_solicitation",
            json!({ "action": "respond", "solicitation_id": sid, "response": "again" }),
        )
        .await;
    assert!(is_error);
    assert!(payload["message"].as_str().unwrap().contains("already resolved"));
}

#[tokio::test]
async fn unknown_tool_is_in_band() {
    let mut client = McpClient::connect();
    client.initialize().await;
    let (payload, is_error) = client.call_tool("warp_drive", json!({})).await;
    assert!(is_error);
    assert_eq!(payload["error"], "not_found");
}
