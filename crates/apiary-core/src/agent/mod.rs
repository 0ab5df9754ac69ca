//! Agent records and conversation plumbing.
//!
//! An agent is a long-lived sandboxed worker: the queen orchestrates, the
//! drones execute. Each agent owns a git worktree on a dedicated branch and
//! runs inside exactly one container while live.

mod conversation;
pub mod manager;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidEnumValue;

pub use conversation::ConversationBuffer;
pub use manager::{AgentManager, AgentProfile, AgentSettings, Conversation, SpawnOptions};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Role of an agent within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Queen,
    Worker,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queen => "queen",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRole {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queen" => Ok(Self::Queen),
            "worker" => Ok(Self::Worker),
            other => Err(InvalidEnumValue::new("agent role", other)),
        }
    }
}

/// Broad area a worker is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSpecialty {
    Front,
    Back,
    Infra,
    Fullstack,
}

impl fmt::Display for AgentSpecialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Front => "front",
            Self::Back => "back",
            Self::Infra => "infra",
            Self::Fullstack => "fullstack",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentSpecialty {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(Self::Front),
            "back" => Ok(Self::Back),
            "infra" => Ok(Self::Infra),
            "fullstack" => Ok(Self::Fullstack),
            other => Err(InvalidEnumValue::new("agent specialty", other)),
        }
    }
}

/// Lifecycle status of an agent.
///
/// ```text
/// pending -> starting -> running -> stopping -> stopped
/// stopped -> starting            (restart)
/// any non-destroyed -> destroyed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Destroyed,
}

impl AgentStatus {
    /// `destroyed` is the only terminal status; a stopped agent may restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(InvalidEnumValue::new("agent status", other)),
        }
    }
}

/// Originator of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Human,
    Agent,
}

impl fmt::Display for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Human => "human",
            Self::Agent => "agent",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A single conversation message attached to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: MessageSender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonic per-agent sequence number.
    pub seq: u64,
}

/// A member of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Human label, unique among non-destroyed agents.
    pub name: String,
    pub role: AgentRole,
    pub specialty: AgentSpecialty,
    pub model: String,
    /// Git branch this agent's worktree has checked out.
    pub branch: String,
    pub workspace_path: PathBuf,
    /// Present once the container has been started at least once.
    pub container_id: Option<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [
            AgentStatus::Pending,
            AgentStatus::Starting,
            AgentStatus::Running,
            AgentStatus::Stopping,
            AgentStatus::Stopped,
            AgentStatus::Error,
            AgentStatus::Destroyed,
        ];
        for v in &variants {
            let parsed: AgentStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_invalid() {
        assert!("hibernating".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn only_destroyed_is_terminal() {
        assert!(AgentStatus::Destroyed.is_terminal());
        assert!(!AgentStatus::Stopped.is_terminal());
        assert!(!AgentStatus::Error.is_terminal());
    }

    #[test]
    fn role_and_specialty_roundtrip() {
        for v in [AgentRole::Queen, AgentRole::Worker] {
            assert_eq!(v, v.to_string().parse().unwrap());
        }
        for v in [
            AgentSpecialty::Front,
            AgentSpecialty::Back,
            AgentSpecialty::Infra,
            AgentSpecialty::Fullstack,
        ] {
            assert_eq!(v, v.to_string().parse().unwrap());
        }
    }

    #[test]
    fn specialty_invalid() {
        assert!("middle".parse::<AgentSpecialty>().is_err());
    }
}
