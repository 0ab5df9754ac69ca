//! The `ContainerRuntime` trait -- the adapter interface for container
//! engines.
//!
//! The hub never shells out to `docker` directly; everything goes through
//! this trait so tests can substitute an in-memory runtime and deployments
//! can swap engines. The trait is object-safe so it can be stored as
//! `Arc<dyn ContainerRuntime>` inside the agent manager.

pub mod docker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use docker::DockerRuntime;

/// Errors reported by a container runtime binding.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The engine binary could not be executed.
    #[error("failed to run {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine ran but reported failure.
    #[error("{command} failed (exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// No container with the given id exists.
    #[error("container not found: {0}")]
    NotFound(String),
}

/// A host directory mapped into the container.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

/// A host port forwarded into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Everything needed to start one agent container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    /// Deterministic container name (sanitized prefix + role + index).
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMapping>,
    /// Command override; empty means the image default.
    pub cmd: Vec<String>,
}

/// The stdio bridge of a running container. Dropping both halves closes
/// the bridge.
pub struct ContainerIo {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Adapter interface for starting and supervising agent containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container; returns the engine's container id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Gracefully stop a container, waiting up to `grace` before the
    /// engine escalates.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Remove a container, killing it if necessary. Must be safe to call
    /// on an already-removed container.
    async fn destroy(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Attach to the container's stdin/stdout.
    async fn stdio(&self, container_id: &str) -> Result<ContainerIo, RuntimeError>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ContainerRuntime) {}
};
