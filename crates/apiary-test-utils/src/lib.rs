//! Shared test doubles for apiary integration tests.
//!
//! Provides in-memory stand-ins for the two collaborator interfaces the
//! hub depends on, with scriptable failure injection and full call
//! recording, plus a helper that assembles a hub on top of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;

use apiary_core::config::HubConfig;
use apiary_core::hub::{Hub, HubContext};
use apiary_core::runtime::{ContainerIo, ContainerRuntime, ContainerSpec, RuntimeError};
use apiary_core::workspace::{WorkspaceError, WorkspaceProvisioner};

// ---------------------------------------------------------------------------
// Fake container runtime
// ---------------------------------------------------------------------------

/// The agent-side ends of a fake container's stdio bridge.
///
/// Write lines into `to_hub` to simulate agent output; read from
/// `from_hub` to observe messages the hub delivered.
pub struct AgentPeer {
    pub to_hub: DuplexStream,
    pub from_hub: DuplexStream,
}

#[derive(Default)]
struct FakeRuntimeState {
    next_id: u64,
    started: Vec<ContainerSpec>,
    running: Vec<String>,
    stop_calls: Vec<(String, Duration)>,
    destroy_calls: Vec<String>,
    peers: HashMap<String, AgentPeer>,
    fail_start: bool,
    fail_stop: bool,
}

/// In-memory [`ContainerRuntime`] recording every call.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeRuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next (and all following) `start` calls fail.
    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    /// Make graceful stops fail, forcing the manager down the destroy path.
    pub fn fail_stop(&self, fail: bool) {
        self.state.lock().unwrap().fail_stop = fail;
    }

    /// Specs of every container started so far.
    pub fn started(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().started.clone()
    }

    /// Ids of containers currently considered running.
    pub fn running(&self) -> Vec<String> {
        self.state.lock().unwrap().running.clone()
    }

    pub fn stop_calls(&self) -> Vec<(String, Duration)> {
        self.state.lock().unwrap().stop_calls.clone()
    }

    pub fn destroy_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().destroy_calls.clone()
    }

    /// Take the agent-side stdio ends for a container, if `stdio` was
    /// called for it.
    pub fn take_peer(&self, container_id: &str) -> Option<AgentPeer> {
        self.state.lock().unwrap().peers.remove(container_id)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(RuntimeError::CommandFailed {
                command: "fake start".into(),
                code: 1,
                stderr: "injected start failure".into(),
            });
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.started.push(spec.clone());
        state.running.push(id.clone());
        Ok(id)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.stop_calls.push((container_id.to_string(), grace));
        if state.fail_stop {
            return Err(RuntimeError::CommandFailed {
                command: "fake stop".into(),
                code: 1,
                stderr: "injected stop failure".into(),
            });
        }
        state.running.retain(|id| id != container_id);
        Ok(())
    }

    async fn destroy(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.destroy_calls.push(container_id.to_string());
        state.running.retain(|id| id != container_id);
        Ok(())
    }

    async fn stdio(&self, container_id: &str) -> Result<ContainerIo, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if !state.running.iter().any(|id| id == container_id) {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        // Two pipes: agent output -> hub reader, hub writer -> agent input.
        let (hub_reader, to_hub) = tokio::io::duplex(4096);
        let (from_hub, hub_writer) = tokio::io::duplex(4096);
        state
            .peers
            .insert(container_id.to_string(), AgentPeer { to_hub, from_hub });
        Ok(ContainerIo {
            reader: Box::new(hub_reader),
            writer: Box::new(hub_writer),
        })
    }
}

// ---------------------------------------------------------------------------
// Fake workspace provisioner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeProvisionerState {
    created: Vec<(PathBuf, String)>,
    removed: Vec<PathBuf>,
    fail_create: bool,
}

/// In-memory [`WorkspaceProvisioner`] recording every call.
#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<FakeProvisionerState>,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// `(path, branch)` pairs of every worktree created.
    pub fn created(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl WorkspaceProvisioner for FakeProvisioner {
    async fn create_worktree(
        &self,
        _repo: &Path,
        branch: &str,
        path: &Path,
    ) -> Result<(), WorkspaceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(WorkspaceError::GitExit {
                command: "fake worktree add".into(),
                code: 128,
                stderr: "injected worktree failure".into(),
            });
        }
        state.created.push((path.to_path_buf(), branch.to_string()));
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), WorkspaceError> {
        self.state.lock().unwrap().removed.push(path.to_path_buf());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hub assembly
// ---------------------------------------------------------------------------

/// A hub wired to fakes, plus handles to script them.
pub struct TestHub {
    pub hub: Arc<Hub>,
    pub runtime: Arc<FakeRuntime>,
    pub provisioner: Arc<FakeProvisioner>,
    /// Keeps the event-log directory alive for the hub's lifetime.
    pub dir: tempfile::TempDir,
}

/// Build a hub on fake collaborators with fast test timeouts.
pub fn test_hub() -> TestHub {
    test_hub_with_config(test_config())
}

pub fn test_hub_with_config(config: HubConfig) -> TestHub {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let runtime = FakeRuntime::new();
    let provisioner = FakeProvisioner::new();
    let context = HubContext {
        repo_path: dir.path().to_path_buf(),
        hub_url: "http://127.0.0.1:9119".to_string(),
    };
    let hub = Hub::new(
        config,
        context,
        runtime.clone() as Arc<dyn ContainerRuntime>,
        provisioner.clone() as Arc<dyn WorkspaceProvisioner>,
    )
    .expect("test hub should build");
    TestHub {
        hub,
        runtime,
        provisioner,
        dir,
    }
}

/// Defaults tightened so failure paths resolve quickly under test.
pub fn test_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.workspace.name = "apiary test".into();
    config.timeouts.spawn_timeout_ms = 2_000;
    config.timeouts.stop_grace_ms = 200;
    config.timeouts.shutdown_grace_ms = 1_000;
    config.timeouts.dispatch_drain_ms = 1_000;
    config
}
