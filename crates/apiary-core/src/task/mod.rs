//! Task, plan and step records.
//!
//! A task binds a plan (ordered steps with definitions-of-done) to one
//! agent. Step execution is tracked step-wise; the task's `current_step`
//! points 1-based into the plan (0 before the task starts).

pub mod manager;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidEnumValue;

pub use manager::{CreateTaskRequest, StepChange, StepSpec, TaskManager};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Assigned,
    InProgress,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses freeze the task against further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(InvalidEnumValue::new("task status", other)),
        }
    }
}

/// Status of a single step within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Waiting,
    Blocked,
}

impl StepStatus {
    /// Statuses that count toward progress.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Waiting => "waiting",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "waiting" => Ok(Self::Waiting),
            "blocked" => Ok(Self::Blocked),
            other => Err(InvalidEnumValue::new("step status", other)),
        }
    }
}

/// Policy the agent follows while executing a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAutonomy {
    Full,
    #[default]
    AskIfUnclear,
    ValidateBeforeNext,
    NotifyWhenDone,
}

impl fmt::Display for StepAutonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::AskIfUnclear => "ask_if_unclear",
            Self::ValidateBeforeNext => "validate_before_next",
            Self::NotifyWhenDone => "notify_when_done",
        };
        f.write_str(s)
    }
}

impl FromStr for StepAutonomy {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "ask_if_unclear" => Ok(Self::AskIfUnclear),
            "validate_before_next" => Ok(Self::ValidateBeforeNext),
            "notify_when_done" => Ok(Self::NotifyWhenDone),
            other => Err(InvalidEnumValue::new("step autonomy", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One unit of work inside a plan. Step ids are 1-based and dense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: u32,
    pub action: String,
    pub description: String,
    /// Definition-of-done bullets; never empty.
    pub dod: Vec<String>,
    pub autonomy: StepAutonomy,
    pub status: StepStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An ordered, non-empty list of steps plus the context the agent needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub context: String,
    pub required_ports: Vec<u16>,
    pub steps: Vec<Step>,
}

/// An output produced while executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub url: String,
}

/// A plan assigned to one agent, tracked step-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub plan: Plan,
    pub status: TaskStatus,
    /// 0 before start, else 1-based index of the active step.
    pub current_step: u32,
    pub result: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Percentage of steps completed or skipped, floored.
    pub fn progress(&self) -> u8 {
        let total = self.plan.steps.len();
        if total == 0 {
            return 0;
        }
        let done = self
            .plan
            .steps
            .iter()
            .filter(|s| s.status.is_done())
            .count();
        ((done * 100) / total) as u8
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
