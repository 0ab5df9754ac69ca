//! Agent lifecycle manager.
//!
//! Drives the full sequence for each agent: lease required ports, create
//! the worktree, start the container, wire the stdio bridge. Spawn is
//! transactional over the observable state: every side effect pushes a
//! compensating action, and the stack unwinds in reverse order on any
//! failure, so a failed spawn leaves no ports, worktrees or containers
//! behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::conversation::ConversationBuffer;
use super::{Agent, AgentRole, AgentSpecialty, AgentStatus, Message, MessageSender};
use crate::error::{HubError, Result};
use crate::event::{EventSink, HubEvent};
use crate::port::{LeaseOutcome, PortRegistry};
use crate::runtime::{ContainerRuntime, ContainerSpec, Mount, PortMapping};
use crate::workspace::{WorkspaceProvisioner, worktree_dir_name};

/// Depth of the per-agent outbound message channel.
const BRIDGE_SEND_BUFFER: usize = 64;

/// Per-role launch template, resolved from configuration.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub image: String,
    pub model: String,
    pub env: HashMap<String, String>,
    pub cmd: Vec<String>,
}

/// Everything the manager needs that does not vary per spawn.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub repo_path: PathBuf,
    /// Directory under which agent worktrees are created.
    pub worktree_base: PathBuf,
    /// Sanitized prefix for deterministic container names.
    pub container_prefix: String,
    /// Address agents use to call back into the hub.
    pub hub_url: String,
    pub queen: AgentProfile,
    pub worker: AgentProfile,
    pub spawn_timeout: Duration,
    pub stop_grace: Duration,
}

/// Input for [`AgentManager::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub name: String,
    pub role: AgentRole,
    pub specialty: AgentSpecialty,
    /// Model override; the role profile's model otherwise.
    pub model: Option<String>,
    /// Branch override; defaults to `apiary/<name>`.
    pub branch: Option<String>,
    pub required_ports: Vec<u16>,
    /// Queue behind busy required ports instead of failing fast.
    pub wait_for_ports: bool,
    pub env: HashMap<String, String>,
}

/// Conversation snapshot handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub agent_id: Uuid,
    pub messages: Vec<Message>,
    /// Digest of compacted history, when the buffer has overflowed.
    pub summary: Option<String>,
}

/// Side effects to undo when spawn fails, unwound in reverse order.
enum Compensation {
    ReleasePort(u16),
    RemoveWorktree(PathBuf),
    DestroyContainer(String),
}

struct AgentRecord {
    agent: Agent,
    conversation: ConversationBuffer,
}

/// Live stdio plumbing for one running agent.
struct AgentBridge {
    outbound: mpsc::Sender<String>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl AgentBridge {
    fn abort(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// Owns all agent records; the only mutator of its map.
pub struct AgentManager {
    state: RwLock<HashMap<Uuid, AgentRecord>>,
    bridges: tokio::sync::Mutex<HashMap<Uuid, AgentBridge>>,
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    ports: Arc<PortRegistry>,
    settings: AgentSettings,
    events: EventSink,
    spawn_counter: AtomicU64,
    /// Handle to ourselves so bridge reader tasks can call back in.
    self_ref: Weak<AgentManager>,
}

impl AgentManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        ports: Arc<PortRegistry>,
        settings: AgentSettings,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: RwLock::new(HashMap::new()),
            bridges: tokio::sync::Mutex::new(HashMap::new()),
            runtime,
            provisioner,
            ports,
            settings,
            events,
            spawn_counter: AtomicU64::new(0),
            self_ref: weak.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Spawn
    // -----------------------------------------------------------------------

    /// Bring a new agent all the way to `running`.
    ///
    /// All-or-nothing on the observable state: on failure the agent record
    /// is removed and every acquired resource released, and the caller
    /// gets a single consolidated error.
    pub async fn spawn(&self, opts: SpawnOptions) -> Result<Agent> {
        if opts.name.trim().is_empty() {
            return Err(HubError::InvalidArgument("agent name must not be empty".into()));
        }

        let deadline = tokio::time::Instant::now() + self.settings.spawn_timeout;
        let agent_id = Uuid::new_v4();
        let index = self.spawn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| format!("apiary/{}", opts.name));
        let workspace_path = self.settings.worktree_base.join(worktree_dir_name(&branch));
        let profile = self.profile_for(opts.role).clone();
        let model = opts.model.clone().unwrap_or_else(|| profile.model.clone());

        // Reserve the name by inserting the pending record.
        let created = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let taken = state
                .values()
                .any(|r| r.agent.name == opts.name && r.agent.status != AgentStatus::Destroyed);
            if taken {
                return Err(HubError::AlreadyExists(format!(
                    "agent name {:?} is in use",
                    opts.name
                )));
            }
            let now = Utc::now();
            let agent = Agent {
                id: agent_id,
                name: opts.name.clone(),
                role: opts.role,
                specialty: opts.specialty,
                model: model.clone(),
                branch: branch.clone(),
                workspace_path: workspace_path.clone(),
                container_id: None,
                status: AgentStatus::Pending,
                created_at: now,
                last_activity_at: now,
            };
            state.insert(
                agent_id,
                AgentRecord {
                    agent: agent.clone(),
                    conversation: ConversationBuffer::new(),
                },
            );
            agent
        };

        self.events.emit(HubEvent::AgentCreated {
            at: created.created_at,
            agent_id,
            name: created.name.clone(),
            role: created.role,
            specialty: created.specialty,
        });

        let mut undo: Vec<Compensation> = Vec::new();
        match self
            .provision(agent_id, &opts, &branch, &workspace_path, &profile, index, deadline, &mut undo)
            .await
        {
            Ok(agent) => {
                tracing::info!(agent_id = %agent_id, name = %agent.name, "agent running");
                Ok(agent)
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, name = %opts.name, error = %e, "spawn failed, rolling back");
                self.unwind(agent_id, undo).await;
                Err(e)
            }
        }
    }

    /// The fallible middle of spawn; every side effect registers its
    /// compensation before the next await.
    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        agent_id: Uuid,
        opts: &SpawnOptions,
        branch: &str,
        workspace_path: &PathBuf,
        profile: &AgentProfile,
        index: u64,
        deadline: tokio::time::Instant,
        undo: &mut Vec<Compensation>,
    ) -> Result<Agent> {
        // 1. Lease every required port up front.
        let mut leased = Vec::new();
        for port in &opts.required_ports {
            match self.ports.lease(agent_id, "required", Some(*port), None)? {
                LeaseOutcome::Granted(lease) => {
                    undo.push(Compensation::ReleasePort(lease.port));
                    leased.push(lease.port);
                }
                LeaseOutcome::Wait(handle) => {
                    if !opts.wait_for_ports {
                        return Err(HubError::Conflict(format!(
                            "port {port} is leased to another agent"
                        )));
                    }
                    let lease = tokio::time::timeout_at(deadline, handle.wait())
                        .await
                        .map_err(|_| {
                            HubError::Timeout(format!("timed out waiting for port {port}"))
                        })??;
                    undo.push(Compensation::ReleasePort(lease.port));
                    leased.push(lease.port);
                }
            }
        }

        // 2. Worktree on the agent's branch.
        self.provisioner
            .create_worktree(&self.settings.repo_path, branch, workspace_path)
            .await
            .map_err(|e| HubError::Unavailable(format!("workspace provisioning failed: {e}")))?;
        undo.push(Compensation::RemoveWorktree(workspace_path.clone()));

        self.set_status(agent_id, AgentStatus::Starting)?;

        // 3. Container.
        let spec = self.container_spec(opts, profile, branch, workspace_path, &leased, index);
        let container_id = tokio::time::timeout_at(deadline, self.runtime.start(&spec))
            .await
            .map_err(|_| HubError::Timeout("container did not start in time".into()))?
            .map_err(|e| HubError::Unavailable(format!("container start failed: {e}")))?;
        undo.push(Compensation::DestroyContainer(container_id.clone()));

        // 4. Commit.
        let agent = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let record = state
                .get_mut(&agent_id)
                .ok_or_else(|| HubError::Internal(format!("agent {agent_id} vanished mid-spawn")))?;
            record.agent.container_id = Some(container_id.clone());
            record.agent.status = AgentStatus::Running;
            record.agent.last_activity_at = Utc::now();
            record.agent.clone()
        };
        self.emit_status(&agent);

        // 5. Conversation plumbing, best-effort.
        self.open_bridge(agent_id, &container_id).await;

        Ok(agent)
    }

    /// Undo recorded side effects in reverse order, then drop the record.
    async fn unwind(&self, agent_id: Uuid, undo: Vec<Compensation>) {
        for action in undo.into_iter().rev() {
            match action {
                Compensation::DestroyContainer(container_id) => {
                    if let Err(e) = self.runtime.destroy(&container_id).await {
                        tracing::warn!(container_id = %container_id, error = %e, "rollback: destroy failed");
                    }
                }
                Compensation::RemoveWorktree(path) => {
                    if let Err(e) = self.provisioner.remove_worktree(&path).await {
                        tracing::warn!(path = %path.display(), error = %e, "rollback: worktree removal failed");
                    }
                }
                Compensation::ReleasePort(port) => {
                    if let Err(e) = self.ports.release(port, agent_id) {
                        tracing::warn!(port, error = %e, "rollback: port release failed");
                    }
                }
            }
        }

        let removed = {
            let mut state = self.state.write().expect("agent lock poisoned");
            state.remove(&agent_id)
        };
        if let Some(record) = removed {
            self.events.emit(HubEvent::AgentStatusChanged {
                at: Utc::now(),
                agent_id,
                name: record.agent.name,
                status: AgentStatus::Error,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Stop / restart / destroy
    // -----------------------------------------------------------------------

    /// Graceful stop: `running -> stopping -> stopped`. Best-effort -- the
    /// terminal `stopped` status is reached even when the engine's
    /// graceful stop fails, via a force destroy of the container. The
    /// workspace and port leases are preserved.
    pub async fn stop(&self, agent_id: Uuid) -> Result<Agent> {
        let container_id = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let record = state
                .get_mut(&agent_id)
                .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
            match record.agent.status {
                AgentStatus::Running | AgentStatus::Starting => {}
                other => {
                    return Err(HubError::FailedPrecondition(format!(
                        "agent {agent_id} is {other}, expected running"
                    )));
                }
            }
            record.agent.status = AgentStatus::Stopping;
            record.agent.container_id.clone()
        };
        self.emit_status_of(agent_id);

        self.close_bridge(agent_id).await;

        if let Some(container_id) = container_id {
            let grace = self.settings.stop_grace;
            let stop = self.runtime.stop(&container_id, grace);
            match tokio::time::timeout(grace * 2, stop).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "graceful stop failed, force-killing");
                    let _ = self.runtime.destroy(&container_id).await;
                }
                Err(_) => {
                    tracing::warn!(agent_id = %agent_id, "graceful stop timed out, force-killing");
                    let _ = self.runtime.destroy(&container_id).await;
                }
            }
        }

        let agent = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let record = state
                .get_mut(&agent_id)
                .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
            record.agent.status = AgentStatus::Stopped;
            record.agent.clone()
        };
        self.emit_status(&agent);
        Ok(agent)
    }

    /// Restart a stopped agent in a fresh container on the preserved
    /// workspace.
    pub async fn restart(&self, agent_id: Uuid) -> Result<Agent> {
        let (agent, profile) = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let record = state
                .get_mut(&agent_id)
                .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
            match record.agent.status {
                AgentStatus::Stopped | AgentStatus::Error => {}
                other => {
                    return Err(HubError::FailedPrecondition(format!(
                        "agent {agent_id} is {other}, expected stopped"
                    )));
                }
            }
            record.agent.status = AgentStatus::Starting;
            (record.agent.clone(), self.profile_for(record.agent.role).clone())
        };
        self.emit_status_of(agent_id);

        // The old container keeps the deterministic name; clear it out.
        if let Some(ref old) = agent.container_id {
            let _ = self.runtime.destroy(old).await;
        }

        let index = self.spawn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let opts = SpawnOptions {
            name: agent.name.clone(),
            role: agent.role,
            specialty: agent.specialty,
            model: Some(agent.model.clone()),
            branch: Some(agent.branch.clone()),
            required_ports: Vec::new(),
            wait_for_ports: false,
            env: HashMap::new(),
        };
        let leased: Vec<u16> = self
            .ports
            .leases()
            .into_iter()
            .filter(|l| l.agent_id == agent_id)
            .map(|l| l.port)
            .collect();
        let spec =
            self.container_spec(&opts, &profile, &agent.branch, &agent.workspace_path, &leased, index);

        match self.runtime.start(&spec).await {
            Ok(container_id) => {
                let agent = {
                    let mut state = self.state.write().expect("agent lock poisoned");
                    let record = state
                        .get_mut(&agent_id)
                        .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
                    record.agent.container_id = Some(container_id.clone());
                    record.agent.status = AgentStatus::Running;
                    record.agent.last_activity_at = Utc::now();
                    record.agent.clone()
                };
                self.emit_status(&agent);
                self.open_bridge(agent_id, &container_id).await;
                Ok(agent)
            }
            Err(e) => {
                {
                    let mut state = self.state.write().expect("agent lock poisoned");
                    if let Some(record) = state.get_mut(&agent_id) {
                        record.agent.status = AgentStatus::Error;
                    }
                }
                self.emit_status_of(agent_id);
                Err(HubError::Unavailable(format!("container restart failed: {e}")))
            }
        }
    }

    /// Tear an agent down for good: stop if needed, release every lease,
    /// remove the worktree, mark `destroyed`. The record stays for history
    /// but the name becomes reusable.
    pub async fn destroy(&self, agent_id: Uuid) -> Result<Agent> {
        let agent = self.get(agent_id)?;
        if agent.status == AgentStatus::Destroyed {
            return Err(HubError::FailedPrecondition(format!(
                "agent {agent_id} is already destroyed"
            )));
        }

        if matches!(agent.status, AgentStatus::Running | AgentStatus::Starting) {
            if let Err(e) = self.stop(agent_id).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "stop during destroy failed");
            }
        }
        self.close_bridge(agent_id).await;

        let freed = self.ports.release_all_for_agent(agent_id);
        if !freed.is_empty() {
            tracing::info!(agent_id = %agent_id, ports = ?freed, "released leases on destroy");
        }

        if let Some(ref container_id) = agent.container_id {
            if let Err(e) = self.runtime.destroy(container_id).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "container removal failed");
            }
        }

        if let Err(e) = self.provisioner.remove_worktree(&agent.workspace_path).await {
            tracing::warn!(
                agent_id = %agent_id,
                path = %agent.workspace_path.display(),
                error = %e,
                "worktree removal failed"
            );
        }

        let agent = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let record = state
                .get_mut(&agent_id)
                .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
            record.agent.status = AgentStatus::Destroyed;
            record.agent.container_id = None;
            record.agent.clone()
        };
        self.emit_status(&agent);
        tracing::info!(agent_id = %agent_id, name = %agent.name, "agent destroyed");
        Ok(agent)
    }

    // -----------------------------------------------------------------------
    // Conversation
    // -----------------------------------------------------------------------

    /// Append a human message and deliver it over the stdio bridge.
    pub async fn send_message(&self, agent_id: Uuid, text: &str) -> Result<Message> {
        let message = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let record = state
                .get_mut(&agent_id)
                .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
            if record.agent.status == AgentStatus::Destroyed {
                return Err(HubError::FailedPrecondition(format!(
                    "agent {agent_id} is destroyed"
                )));
            }
            record.agent.last_activity_at = Utc::now();
            record.conversation.push(MessageSender::Human, text)
        };

        self.events.emit(HubEvent::AgentMessage {
            at: message.timestamp,
            agent_id,
            from: MessageSender::Human,
            seq: message.seq,
            text: message.text.clone(),
        });

        let bridges = self.bridges.lock().await;
        match bridges.get(&agent_id) {
            Some(bridge) => {
                if let Err(e) = bridge.outbound.try_send(text.to_string()) {
                    tracing::warn!(agent_id = %agent_id, error = %e, "message not delivered to container");
                }
            }
            None => {
                tracing::warn!(agent_id = %agent_id, "no stdio bridge; message recorded only");
            }
        }

        Ok(message)
    }

    /// Ordered message buffer plus the compaction summary.
    pub fn get_conversation(&self, agent_id: Uuid) -> Result<Conversation> {
        let state = self.state.read().expect("agent lock poisoned");
        let record = state
            .get(&agent_id)
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        Ok(Conversation {
            agent_id,
            messages: record.conversation.messages(),
            summary: record.conversation.summary().map(String::from),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, agent_id: Uuid) -> Result<Agent> {
        let state = self.state.read().expect("agent lock poisoned");
        state
            .get(&agent_id)
            .map(|r| r.agent.clone())
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))
    }

    /// Look an agent up by its unique name (non-destroyed agents only).
    pub fn find_by_name(&self, name: &str) -> Option<Agent> {
        let state = self.state.read().expect("agent lock poisoned");
        state
            .values()
            .map(|r| &r.agent)
            .find(|a| a.name == name && a.status != AgentStatus::Destroyed)
            .cloned()
    }

    pub fn list(&self) -> Vec<Agent> {
        let state = self.state.read().expect("agent lock poisoned");
        let mut agents: Vec<Agent> = state.values().map(|r| r.agent.clone()).collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }

    pub fn count(&self) -> usize {
        let state = self.state.read().expect("agent lock poisoned");
        state.len()
    }

    pub fn count_running(&self) -> usize {
        let state = self.state.read().expect("agent lock poisoned");
        state
            .values()
            .filter(|r| r.agent.status == AgentStatus::Running)
            .count()
    }

    /// Abort all bridge tasks; used at hub shutdown.
    pub async fn close(&self) {
        let mut bridges = self.bridges.lock().await;
        for (_, bridge) in bridges.drain() {
            bridge.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn profile_for(&self, role: AgentRole) -> &AgentProfile {
        match role {
            AgentRole::Queen => &self.settings.queen,
            AgentRole::Worker => &self.settings.worker,
        }
    }

    /// Compose the container spec from config, options and leased ports.
    fn container_spec(
        &self,
        opts: &SpawnOptions,
        profile: &AgentProfile,
        branch: &str,
        workspace_path: &PathBuf,
        leased_ports: &[u16],
        index: u64,
    ) -> ContainerSpec {
        let mut env = profile.env.clone();
        env.extend(opts.env.clone());
        env.insert("APIARY_HUB_URL".into(), self.settings.hub_url.clone());
        env.insert("APIARY_AGENT_NAME".into(), opts.name.clone());
        env.insert("APIARY_AGENT_ROLE".into(), opts.role.to_string());
        env.insert("APIARY_BRANCH".into(), branch.to_string());
        env.insert(
            "APIARY_MODEL".into(),
            opts.model.clone().unwrap_or_else(|| profile.model.clone()),
        );
        if !leased_ports.is_empty() {
            let ports: Vec<String> = leased_ports.iter().map(u16::to_string).collect();
            env.insert("APIARY_PORTS".into(), ports.join(","));
        }

        ContainerSpec {
            name: format!("{}-{}-{}", self.settings.container_prefix, opts.role, index),
            image: profile.image.clone(),
            env,
            mounts: vec![Mount {
                host_path: workspace_path.clone(),
                container_path: PathBuf::from("/workspace"),
                read_only: false,
            }],
            ports: leased_ports
                .iter()
                .map(|p| PortMapping { host: *p, container: *p })
                .collect(),
            cmd: profile.cmd.clone(),
        }
    }

    /// Attach the stdio bridge: a writer task draining the outbound
    /// channel and a reader task turning container output lines into
    /// conversation messages. Failure to attach is logged, not fatal.
    async fn open_bridge(&self, agent_id: Uuid, container_id: &str) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        let io = match self.runtime.stdio(container_id).await {
            Ok(io) => io,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "stdio bridge unavailable");
                return;
            }
        };

        let (outbound, mut rx) = mpsc::channel::<String>(BRIDGE_SEND_BUFFER);
        let mut writer = io.writer;
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(io.reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                manager.record_agent_output(agent_id, line);
            }
            tracing::debug!(agent_id = %agent_id, "agent output stream ended");
        });

        let mut bridges = self.bridges.lock().await;
        if let Some(old) = bridges.insert(
            agent_id,
            AgentBridge {
                outbound,
                reader_task,
                writer_task,
            },
        ) {
            old.abort();
        }
    }

    async fn close_bridge(&self, agent_id: Uuid) {
        let mut bridges = self.bridges.lock().await;
        if let Some(bridge) = bridges.remove(&agent_id) {
            bridge.abort();
        }
    }

    /// Record one line of container output as an agent message.
    fn record_agent_output(&self, agent_id: Uuid, text: String) {
        let message = {
            let mut state = self.state.write().expect("agent lock poisoned");
            let Some(record) = state.get_mut(&agent_id) else {
                return;
            };
            record.agent.last_activity_at = Utc::now();
            record.conversation.push(MessageSender::Agent, text)
        };
        self.events.emit(HubEvent::AgentMessage {
            at: message.timestamp,
            agent_id,
            from: MessageSender::Agent,
            seq: message.seq,
            text: message.text,
        });
    }

    fn set_status(&self, agent_id: Uuid, status: AgentStatus) -> Result<()> {
        {
            let mut state = self.state.write().expect("agent lock poisoned");
            let record = state
                .get_mut(&agent_id)
                .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
            record.agent.status = status;
        }
        self.emit_status_of(agent_id);
        Ok(())
    }

    fn emit_status_of(&self, agent_id: Uuid) {
        let agent = {
            let state = self.state.read().expect("agent lock poisoned");
            state.get(&agent_id).map(|r| r.agent.clone())
        };
        if let Some(agent) = agent {
            self.emit_status(&agent);
        }
    }

    fn emit_status(&self, agent: &Agent) {
        self.events.emit(HubEvent::AgentStatusChanged {
            at: Utc::now(),
            agent_id: agent.id,
            name: agent.name.clone(),
            status: agent.status,
        });
    }
}
