//! Hub configuration.
//!
//! The structs here are the structured form every [`ConfigSource`] must
//! produce; how they are read off disk (format, search paths, env
//! overrides) is the CLI's business. Validation is centralized in
//! [`HubConfig::validate`] so every source gets the same rules.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

/// Fallback container prefix when sanitization eats the whole name.
pub const DEFAULT_CONTAINER_PREFIX: &str = "apiary";

/// Longest allowed container prefix.
const PREFIX_MAX_LEN: usize = 20;

/// Anything that can produce a hub configuration.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<HubConfig>;
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub workspace: WorkspaceConfig,
    pub redis: RedisConfig,
    pub agents: AgentsConfig,
    pub monitoring: MonitoringConfig,
    pub hooks: HooksConfig,
    pub playwright: PlaywrightConfig,
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Project name; container names derive from it.
    pub name: String,
    /// Explicit prefix override; otherwise sanitized from `name`.
    pub container_prefix: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            name: "apiary".to_string(),
            container_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { port: 6379 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub queen: QueenConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueenConfig {
    pub model: String,
    pub dockerfile: String,
    pub env: HashMap<String, String>,
    pub ports: Vec<u16>,
}

impl Default for QueenConfig {
    fn default() -> Self {
        Self {
            model: "opus".to_string(),
            dockerfile: "Dockerfile.queen".to_string(),
            env: HashMap::new(),
            ports: Vec::new(),
        }
    }
}

/// How workers consume their queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Worker waits for a human or queen to drive it.
    Interactive,
    /// Worker polls for assigned tasks on its own.
    #[default]
    Daemon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub mode: WorkerMode,
    pub model: String,
    pub dockerfile: String,
    pub poll_interval_s: u64,
    pub env: HashMap<String, String>,
    pub ports: Vec<u16>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 2,
            mode: WorkerMode::Daemon,
            model: "sonnet".to_string(),
            dockerfile: "Dockerfile.worker".to_string(),
            poll_interval_s: 10,
            env: HashMap::new(),
            ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub queen: MonitorConfig,
    pub worker: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_s: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Command run once inside a fresh workspace before the agent starts.
    pub init: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    pub mode: String,
    pub browser_endpoint: Option<String>,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            mode: "off".to_string(),
            browser_endpoint: None,
        }
    }
}

/// Deadlines and cadences, all overridable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub spawn_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub shutdown_grace_ms: u64,
    pub sse_write_timeout_ms: u64,
    pub heartbeat_s: u64,
    pub dispatch_drain_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 60_000,
            stop_grace_ms: 10_000,
            shutdown_grace_ms: 5_000,
            sse_write_timeout_ms: 5_000,
            heartbeat_s: 15,
            dispatch_drain_ms: 2_000,
        }
    }
}

impl HubConfig {
    /// Check the cross-field rules a source cannot express in types.
    pub fn validate(&self) -> Result<()> {
        if self.workspace.name.trim().is_empty() {
            return Err(HubError::InvalidArgument(
                "workspace.name must not be empty".into(),
            ));
        }
        if self.redis.port < 1024 {
            return Err(HubError::InvalidArgument(format!(
                "redis.port {} must be in 1024-65535",
                self.redis.port
            )));
        }
        if !(1..=10).contains(&self.agents.workers.count) {
            return Err(HubError::InvalidArgument(format!(
                "workers.count {} must be in 1-10",
                self.agents.workers.count
            )));
        }
        if self.agents.workers.poll_interval_s == 0 {
            return Err(HubError::InvalidArgument(
                "workers.poll_interval_s must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The container prefix: explicit override, else sanitized project
    /// name.
    pub fn container_prefix(&self) -> String {
        self.workspace
            .container_prefix
            .clone()
            .unwrap_or_else(|| sanitize_container_prefix(&self.workspace.name))
    }
}

/// Derive a container prefix from a project name.
///
/// Lowercases, collapses every non-`[a-z0-9]` run to a single `-`, trims
/// leading/trailing `-`, truncates to 20 chars, trims a trailing `-`
/// again, and falls back to [`DEFAULT_CONTAINER_PREFIX`] when nothing is
/// left.
pub fn sanitize_container_prefix(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }

    out.truncate(PREFIX_MAX_LEN);
    while out.ends_with('-') {
        out.pop();
    }

    if out.is_empty() {
        DEFAULT_CONTAINER_PREFIX.to_string()
    } else {
        out
    }
}
