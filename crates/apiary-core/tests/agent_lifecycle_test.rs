//! Agent lifecycle integration tests against fake collaborators.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use apiary_core::HubEvent;
use apiary_core::agent::{AgentRole, AgentSpecialty, AgentStatus, MessageSender, SpawnOptions};
use apiary_core::error::HubError;
use apiary_core::task::{CreateTaskRequest, StepSpec, TaskStatus};
use apiary_test_utils::test_hub;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spawn_opts(name: &str) -> SpawnOptions {
    SpawnOptions {
        name: name.to_string(),
        role: AgentRole::Worker,
        specialty: AgentSpecialty::Back,
        model: None,
        branch: None,
        required_ports: vec![],
        wait_for_ports: false,
        env: HashMap::new(),
    }
}

fn one_step_task(agent_id: uuid::Uuid, title: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        agent_id,
        title: title.to_string(),
        description: String::new(),
        context: String::new(),
        required_ports: vec![],
        steps: vec![StepSpec {
            action: "do it".into(),
            description: String::new(),
            dod: vec!["it is done".into()],
            autonomy: None,
        }],
    }
}

/// Drain events from a subscription until `kind` shows up.
async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<HubEvent>,
    kind: &str,
) -> HubEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_reaches_running_and_emits_events() {
    let t = test_hub();
    let mut rx = t.hub.subscribe();

    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Running);
    assert_eq!(agent.branch, "apiary/drone-1");
    assert!(agent.container_id.is_some());

    let created = wait_for_event(&mut rx, "agent_created").await;
    match created {
        HubEvent::AgentCreated { name, role, .. } => {
            assert_eq!(name, "drone-1");
            assert_eq!(role, AgentRole::Worker);
        }
        other => panic!("unexpected event {other:?}"),
    }
    // The status stream ends at running.
    loop {
        let event = wait_for_event(&mut rx, "agent_status_changed").await;
        if let HubEvent::AgentStatusChanged { status, .. } = event {
            if status == AgentStatus::Running {
                break;
            }
        }
    }

    // Exactly one container was started, named from the sanitized prefix.
    let started = t.runtime.started();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].name, "apiary-test-worker-1");
    assert_eq!(started[0].env.get("APIARY_AGENT_NAME").unwrap(), "drone-1");

    // One worktree on the agent branch.
    let created = t.provisioner.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].1, "apiary/drone-1");
}

#[tokio::test]
async fn spawn_leases_required_ports() {
    let t = test_hub();
    let mut opts = spawn_opts("drone-1");
    opts.required_ports = vec![3000, 3100];

    let agent = t.hub.spawn_agent(opts).await.unwrap();
    let leases = t.hub.list_ports();
    assert_eq!(leases.len(), 2);
    assert!(leases.iter().all(|l| l.agent_id == agent.id));

    let spec = &t.runtime.started()[0];
    assert_eq!(spec.env.get("APIARY_PORTS").unwrap(), "3000,3100");
    assert_eq!(spec.ports.len(), 2);
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let t = test_hub();
    t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    let err = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap_err();
    assert!(matches!(err, HubError::AlreadyExists(_)));
    assert_eq!(t.hub.list_agents().len(), 1);
}

#[tokio::test]
async fn spawn_rolls_back_on_container_failure() {
    let t = test_hub();
    t.runtime.fail_start(true);

    let mut opts = spawn_opts("drone-1");
    opts.required_ports = vec![3000];
    let err = t.hub.spawn_agent(opts).await.unwrap_err();
    assert!(matches!(err, HubError::Unavailable(_)), "got: {err}");

    // Everything unwound: no record, no lease, worktree removed.
    assert!(t.hub.list_agents().is_empty());
    assert!(t.hub.list_ports().is_empty());
    assert_eq!(t.provisioner.removed().len(), 1);

    // The name is free again.
    t.runtime.fail_start(false);
    t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
}

#[tokio::test]
async fn spawn_rolls_back_on_worktree_failure() {
    let t = test_hub();
    t.provisioner.fail_create(true);

    let mut opts = spawn_opts("drone-1");
    opts.required_ports = vec![3000];
    let err = t.hub.spawn_agent(opts).await.unwrap_err();
    assert!(matches!(err, HubError::Unavailable(_)));

    assert!(t.hub.list_agents().is_empty());
    assert!(t.hub.list_ports().is_empty(), "leased port must be returned");
    assert!(t.runtime.started().is_empty(), "container must not start");
}

#[tokio::test]
async fn spawn_fails_fast_on_port_conflict() {
    let t = test_hub();
    let mut first = spawn_opts("drone-1");
    first.required_ports = vec![3000];
    t.hub.spawn_agent(first).await.unwrap();

    let mut second = spawn_opts("drone-2");
    second.required_ports = vec![3000];
    let err = t.hub.spawn_agent(second).await.unwrap_err();
    assert!(matches!(err, HubError::Conflict(_)));
    assert!(t.hub.list_agents().iter().all(|a| a.name != "drone-2"));
}

// ---------------------------------------------------------------------------
// Stop / restart / destroy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_cancels_tasks_and_keeps_workspace() {
    let t = test_hub();
    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    let task = t.hub.create_task(one_step_task(agent.id, "work")).unwrap();
    t.hub.start_task(task.id).unwrap();

    let stopped = t.hub.stop_agent(agent.id).await.unwrap();
    assert_eq!(stopped.status, AgentStatus::Stopped);

    // In-flight task was cancelled through the façade.
    let task = t.hub.get_task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.error.as_deref(), Some("agent stopped"));

    // Workspace preserved.
    assert!(t.provisioner.removed().is_empty());
}

#[tokio::test]
async fn stop_falls_back_to_force_kill() {
    let t = test_hub();
    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    t.runtime.fail_stop(true);

    let stopped = t.hub.stop_agent(agent.id).await.unwrap();
    // Terminal stopped reached even though graceful stop failed.
    assert_eq!(stopped.status, AgentStatus::Stopped);
    assert_eq!(t.runtime.destroy_calls().len(), 1);
}

#[tokio::test]
async fn stopped_agent_can_restart() {
    let t = test_hub();
    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    let first_container = agent.container_id.clone().unwrap();

    t.hub.stop_agent(agent.id).await.unwrap();
    let restarted = t.hub.restart_agent(agent.id).await.unwrap();

    assert_eq!(restarted.status, AgentStatus::Running);
    let second_container = restarted.container_id.unwrap();
    assert_ne!(first_container, second_container);
    // Same workspace, no second worktree.
    assert_eq!(t.provisioner.created().len(), 1);
}

#[tokio::test]
async fn destroy_frees_leases_and_workspace_and_name() {
    let t = test_hub();
    let mut opts = spawn_opts("drone-1");
    opts.required_ports = vec![3000];
    let agent = t.hub.spawn_agent(opts).await.unwrap();
    let task = t.hub.create_task(one_step_task(agent.id, "work")).unwrap();

    let destroyed = t.hub.destroy_agent(agent.id).await.unwrap();
    assert_eq!(destroyed.status, AgentStatus::Destroyed);

    // destroyed => no leases held.
    assert!(t.hub.list_ports().is_empty());
    assert_eq!(t.provisioner.removed().len(), 1);
    assert_eq!(
        t.hub.get_task(task.id).unwrap().status,
        TaskStatus::Cancelled
    );

    // Destroyed is terminal.
    assert!(t.hub.destroy_agent(agent.id).await.is_err());
    assert!(t.hub.restart_agent(agent.id).await.is_err());

    // Name is reusable; the destroyed record remains in the listing.
    t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    assert_eq!(t.hub.list_agents().len(), 2);
}

// ---------------------------------------------------------------------------
// Conversation plumbing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_message_is_recorded_and_delivered() {
    let t = test_hub();
    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    let container_id = agent.container_id.clone().unwrap();
    let peer = t.runtime.take_peer(&container_id).expect("bridge attached");

    let message = t.hub.send_message(agent.id, "status report, please").await.unwrap();
    assert_eq!(message.seq, 0);
    assert_eq!(message.from, MessageSender::Human);

    // The exact line arrives on the container's stdin.
    let mut lines = BufReader::new(peer.from_hub).lines();
    let delivered = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("delivery timed out")
        .unwrap()
        .unwrap();
    assert_eq!(delivered, "status report, please");

    let conversation = t.hub.get_conversation(agent.id).unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].text, "status report, please");
}

#[tokio::test]
async fn agent_output_becomes_conversation_messages() {
    let t = test_hub();
    let mut rx = t.hub.subscribe();
    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    let container_id = agent.container_id.clone().unwrap();
    let mut peer = t.runtime.take_peer(&container_id).expect("bridge attached");

    peer.to_hub.write_all(b"starting on step 1\n").await.unwrap();
    peer.to_hub.flush().await.unwrap();

    let event = wait_for_event(&mut rx, "agent_message").await;
    match event {
        HubEvent::AgentMessage { from, text, .. } => {
            assert_eq!(from, MessageSender::Agent);
            assert_eq!(text, "starting on step 1");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let conversation = t.hub.get_conversation(agent.id).unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].from, MessageSender::Agent);
}

#[tokio::test]
async fn conversation_seq_interleaves_both_sides() {
    let t = test_hub();
    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();

    t.hub.send_message(agent.id, "one").await.unwrap();
    t.hub.send_message(agent.id, "two").await.unwrap();

    let conversation = t.hub.get_conversation(agent.id).unwrap();
    let seqs: Vec<u64> = conversation.messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![0, 1]);
}

// ---------------------------------------------------------------------------
// Status invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn at_most_one_container_per_agent() {
    let t = test_hub();
    let agent = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();

    // One running container after spawn.
    assert_eq!(t.runtime.running().len(), 1);

    t.hub.stop_agent(agent.id).await.unwrap();
    assert!(t.runtime.running().is_empty());

    t.hub.restart_agent(agent.id).await.unwrap();
    assert_eq!(t.runtime.running().len(), 1);
}

#[tokio::test]
async fn status_counters_track_fleet() {
    let t = test_hub();
    let status = t.hub.status();
    assert_eq!(status.agents_total, 0);

    let a = t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();
    t.hub.spawn_agent(spawn_opts("drone-2")).await.unwrap();
    t.hub.create_task(one_step_task(a.id, "work")).unwrap();

    let status = t.hub.status();
    assert_eq!(status.agents_total, 2);
    assert_eq!(status.agents_running, 2);
    assert_eq!(status.tasks_total, 1);

    t.hub.stop_agent(a.id).await.unwrap();
    assert_eq!(t.hub.status().agents_running, 1);
}
