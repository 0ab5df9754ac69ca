//! The hub façade.
//!
//! Aggregates the managers behind one surface the MCP server and the
//! observer both call. The façade is stateless apart from owning the
//! manager instances and two context values; cross-manager operations
//! (stop agent + cancel its tasks) are sequenced here so the managers
//! never call each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Agent, AgentManager, AgentProfile, AgentSettings, Conversation, Message, SpawnOptions};
use crate::config::HubConfig;
use crate::error::Result;
use crate::event::{Dispatcher, EventLog, EventSink, HubEvent};
use crate::port::{PortLease, PortRegistry, PortWaiter, DEFAULT_SCAN_RANGE};
use crate::runtime::ContainerRuntime;
use crate::solicitation::{
    CreateSolicitationRequest, Solicitation, SolicitationManager, SolicitationType, Urgency,
};
use crate::task::{Artifact, CreateTaskRequest, StepChange, Task, TaskManager};
use crate::workspace::WorkspaceProvisioner;

/// Depth of the dispatcher queue feeding observers.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Capacity of the broadcast channel observers subscribe to.
const BROADCAST_CAPACITY: usize = 256;

/// Point-in-time counters for dashboards and `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    pub agents_total: usize,
    pub agents_running: usize,
    pub tasks_total: usize,
    pub solicitations_pending: usize,
    pub ports_leased: usize,
}

/// Full state dump sent as the first frame to every new observer.
#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub status: HubStatus,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub solicitations: Vec<Solicitation>,
    pub leases: Vec<PortLease>,
}

/// Immutable context the façade injects into manager calls.
#[derive(Debug, Clone)]
pub struct HubContext {
    pub repo_path: PathBuf,
    pub hub_url: String,
}

/// The coordination hub. Owns every manager; everything else holds an
/// `Arc<Hub>`.
pub struct Hub {
    context: HubContext,
    config: HubConfig,
    dispatcher: Arc<Dispatcher<HubEvent>>,
    broadcast: broadcast::Sender<HubEvent>,
    ports: Arc<PortRegistry>,
    tasks: Arc<TaskManager>,
    solicitations: Arc<SolicitationManager>,
    agents: Arc<AgentManager>,
    cancel: CancellationToken,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Assemble a hub from validated config and the two collaborator
    /// bindings.
    pub fn new(
        config: HubConfig,
        context: HubContext,
        runtime: Arc<dyn ContainerRuntime>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let log = EventLog::new(context.repo_path.join(".apiary").join("events.log"));
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        // Single worker: observers see events in emission order.
        let fanout = broadcast_tx.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(move |event: HubEvent| {
                log.append(&event);
                // No receivers is fine; the bus does not care.
                let _ = fanout.send(event);
                async {}.boxed()
            }),
            1,
            EVENT_QUEUE_DEPTH,
            Duration::from_millis(config.timeouts.dispatch_drain_ms),
        ));
        dispatcher.start();
        let sink = EventSink::new(Arc::clone(&dispatcher));

        let ports = Arc::new(PortRegistry::new(DEFAULT_SCAN_RANGE, sink.clone()));
        let tasks = Arc::new(TaskManager::new(sink.clone()));
        let solicitations = Arc::new(SolicitationManager::new(sink.clone()));

        let prefix = config.container_prefix();
        let worktree_base = default_worktree_base(&context.repo_path);
        let settings = AgentSettings {
            repo_path: context.repo_path.clone(),
            worktree_base,
            container_prefix: prefix,
            hub_url: context.hub_url.clone(),
            queen: profile_from(&config, true),
            worker: profile_from(&config, false),
            spawn_timeout: Duration::from_millis(config.timeouts.spawn_timeout_ms),
            stop_grace: Duration::from_millis(config.timeouts.stop_grace_ms),
        };
        let agents = AgentManager::new(
            runtime,
            provisioner,
            Arc::clone(&ports),
            settings,
            sink,
        );

        let hub = Arc::new(Self {
            context,
            config,
            dispatcher,
            broadcast: broadcast_tx,
            ports,
            tasks,
            solicitations,
            agents,
            cancel: CancellationToken::new(),
            heartbeat: std::sync::Mutex::new(None),
        });
        Self::start_heartbeat(&hub);
        Ok(hub)
    }

    fn start_heartbeat(this: &Arc<Self>) {
        let hub = Arc::clone(this);
        let interval = Duration::from_secs(this.config.timeouts.heartbeat_s.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the heartbeat
            // starts one interval in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.dispatcher.dispatch(HubEvent::HubHeartbeat {
                            at: chrono::Utc::now(),
                            agents_running: hub.agents.count_running(),
                        });
                    }
                    _ = hub.cancel.cancelled() => break,
                }
            }
        });
        *this.heartbeat.lock().expect("heartbeat lock poisoned") = Some(handle);
    }

    // -----------------------------------------------------------------------
    // Context / wiring accessors
    // -----------------------------------------------------------------------

    pub fn context(&self) -> &HubContext {
        &self.context
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Token observers watch to learn the hub is shutting down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.broadcast.subscribe()
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn spawn_agent(&self, opts: SpawnOptions) -> Result<Agent> {
        self.agents.spawn(opts).await
    }

    /// Stop an agent and cancel its in-flight tasks.
    pub async fn stop_agent(&self, agent_id: Uuid) -> Result<Agent> {
        let agent = self.agents.stop(agent_id).await?;
        let cancelled = self.tasks.cancel_all_for_agent(agent_id, "agent stopped");
        if cancelled > 0 {
            tracing::info!(agent_id = %agent_id, cancelled, "cancelled tasks of stopped agent");
        }
        Ok(agent)
    }

    pub async fn restart_agent(&self, agent_id: Uuid) -> Result<Agent> {
        self.agents.restart(agent_id).await
    }

    /// Destroy an agent, cancelling its tasks and freeing its workspace
    /// and leases.
    pub async fn destroy_agent(&self, agent_id: Uuid) -> Result<Agent> {
        let cancelled = self.tasks.cancel_all_for_agent(agent_id, "agent destroyed");
        if cancelled > 0 {
            tracing::info!(agent_id = %agent_id, cancelled, "cancelled tasks of destroyed agent");
        }
        self.agents.destroy(agent_id).await
    }

    pub async fn send_message(&self, agent_id: Uuid, text: &str) -> Result<Message> {
        self.agents.send_message(agent_id, text).await
    }

    pub fn get_conversation(&self, agent_id: Uuid) -> Result<Conversation> {
        self.agents.get_conversation(agent_id)
    }

    pub fn get_agent(&self, agent_id: Uuid) -> Result<Agent> {
        self.agents.get(agent_id)
    }

    pub fn find_agent_by_name(&self, name: &str) -> Option<Agent> {
        self.agents.find_by_name(name)
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.agents.list()
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Create a task for an existing agent; the agent's name is resolved
    /// here so the task manager stays decoupled.
    pub fn create_task(&self, req: CreateTaskRequest) -> Result<Task> {
        let agent = self.agents.get(req.agent_id)?;
        self.tasks.create(req, &agent.name)
    }

    pub fn start_task(&self, task_id: Uuid) -> Result<Task> {
        self.tasks.start(task_id)
    }

    pub fn update_task_step(&self, task_id: Uuid, step_id: u32, change: StepChange) -> Result<Task> {
        self.tasks.update_step(task_id, step_id, change)
    }

    pub fn complete_task(
        &self,
        task_id: Uuid,
        result: Option<String>,
        artifacts: Vec<Artifact>,
    ) -> Result<Task> {
        self.tasks.complete(task_id, result, artifacts)
    }

    pub fn fail_task(&self, task_id: Uuid, error: &str) -> Result<Task> {
        self.tasks.fail(task_id, error)
    }

    pub fn cancel_task(&self, task_id: Uuid, reason: &str) -> Result<Task> {
        self.tasks.cancel(task_id, reason)
    }

    pub fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.tasks.get(task_id)
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks.list()
    }

    pub fn task_for_agent(&self, agent_id: Uuid) -> Option<Task> {
        self.tasks.get_by_agent(agent_id)
    }

    // -----------------------------------------------------------------------
    // Solicitations
    // -----------------------------------------------------------------------

    pub fn create_solicitation(
        &self,
        agent_id: Uuid,
        kind: SolicitationType,
        urgency: Urgency,
        message: String,
        context: Option<String>,
    ) -> Result<Solicitation> {
        let agent = self.agents.get(agent_id)?;
        self.solicitations.create(CreateSolicitationRequest {
            agent_id,
            agent_name: agent.name,
            kind,
            urgency,
            message,
            context,
        })
    }

    pub fn respond_solicitation(&self, id: Uuid, response: &str) -> Result<Solicitation> {
        self.solicitations.respond(id, response)
    }

    pub fn dismiss_solicitation(&self, id: Uuid) -> Result<Solicitation> {
        self.solicitations.dismiss(id)
    }

    pub fn get_solicitation(&self, id: Uuid) -> Result<Solicitation> {
        self.solicitations.get(id)
    }

    pub fn list_pending_solicitations(&self, agent_id: Option<Uuid>) -> Vec<Solicitation> {
        self.solicitations.list_pending(agent_id)
    }

    // -----------------------------------------------------------------------
    // Ports
    // -----------------------------------------------------------------------

    pub fn list_ports(&self) -> Vec<PortLease> {
        self.ports.leases()
    }

    pub fn list_port_waiters(&self) -> Vec<PortWaiter> {
        self.ports.waiters()
    }

    pub fn force_release_port(&self, port: u16) -> Result<()> {
        self.ports.force_release(port)
    }

    // -----------------------------------------------------------------------
    // Status / shutdown
    // -----------------------------------------------------------------------

    /// Counters computed at call time.
    pub fn status(&self) -> HubStatus {
        HubStatus {
            agents_total: self.agents.count(),
            agents_running: self.agents.count_running(),
            tasks_total: self.tasks.count(),
            solicitations_pending: self.solicitations.pending_count(),
            ports_leased: self.ports.lease_count(),
        }
    }

    /// Everything an observer needs to render before deltas arrive.
    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            status: self.status(),
            agents: self.agents.list(),
            tasks: self.tasks.list(),
            solicitations: self.solicitations.list_all(),
            leases: self.ports.leases(),
        }
    }

    /// Shut the hub down: cancel outstanding work, abort agent bridges,
    /// and drain the dispatcher within the shutdown grace window.
    pub async fn close(&self) {
        self.cancel.cancel();
        let heartbeat = self
            .heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
            .take();
        if let Some(handle) = heartbeat {
            let grace = Duration::from_millis(self.config.timeouts.shutdown_grace_ms);
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("heartbeat task did not stop within grace window");
            }
        }
        self.agents.close().await;
        self.dispatcher.stop().await;
        tracing::info!("hub closed");
    }
}

/// Worktrees live in a sibling directory of the repository so agent
/// checkouts never nest inside it.
fn default_worktree_base(repo_path: &std::path::Path) -> PathBuf {
    let repo_name = repo_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo");
    let base_name = format!("{repo_name}-apiary-worktrees");
    repo_path
        .parent()
        .map(|p| p.join(&base_name))
        .unwrap_or_else(|| PathBuf::from(base_name))
}

fn profile_from(config: &HubConfig, queen: bool) -> AgentProfile {
    if queen {
        let q = &config.agents.queen;
        AgentProfile {
            image: image_for_dockerfile(&q.dockerfile),
            model: q.model.clone(),
            env: q.env.clone(),
            cmd: Vec::new(),
        }
    } else {
        let w = &config.agents.workers;
        AgentProfile {
            image: image_for_dockerfile(&w.dockerfile),
            model: w.model.clone(),
            env: w.env.clone(),
            cmd: Vec::new(),
        }
    }
}

/// Image tag conventionally built from a dockerfile name:
/// `Dockerfile.queen` -> `apiary-queen:latest`.
fn image_for_dockerfile(dockerfile: &str) -> String {
    let suffix = dockerfile
        .rsplit('.')
        .next()
        .filter(|s| !s.is_empty() && *s != dockerfile)
        .unwrap_or("agent");
    format!("apiary-{suffix}:latest")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_base_is_repo_sibling() {
        let base = default_worktree_base(std::path::Path::new("/home/me/project"));
        assert_eq!(base, PathBuf::from("/home/me/project-apiary-worktrees"));
    }

    #[test]
    fn image_name_derives_from_dockerfile() {
        assert_eq!(image_for_dockerfile("Dockerfile.queen"), "apiary-queen:latest");
        assert_eq!(image_for_dockerfile("Dockerfile.worker"), "apiary-worker:latest");
        assert_eq!(image_for_dockerfile("Dockerfile"), "apiary-agent:latest");
    }
}
