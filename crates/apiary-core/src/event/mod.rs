//! Hub events and the dispatch pipeline.
//!
//! Every state change a manager commits is published as a [`HubEvent`]
//! through a single [`Dispatcher`]. Managers emit after releasing their
//! own lock, so an event is only ever observed once the mutation it
//! describes is visible.

pub mod dispatcher;
pub mod log;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentRole, AgentSpecialty, AgentStatus, MessageSender};
use crate::solicitation::{SolicitationStatus, SolicitationType, Urgency};

pub use dispatcher::{Dispatcher, DispatcherStats};
pub use log::EventLog;

/// An immutable record of something that happened inside the hub.
///
/// The serialized form is the observer wire format: the `type` tag doubles
/// as the SSE event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    AgentCreated {
        at: DateTime<Utc>,
        agent_id: Uuid,
        name: String,
        role: AgentRole,
        specialty: AgentSpecialty,
    },
    AgentStatusChanged {
        at: DateTime<Utc>,
        agent_id: Uuid,
        name: String,
        status: AgentStatus,
    },
    AgentMessage {
        at: DateTime<Utc>,
        agent_id: Uuid,
        from: MessageSender,
        seq: u64,
        text: String,
    },
    TaskCreated {
        at: DateTime<Utc>,
        task_id: Uuid,
        agent_id: Uuid,
        title: String,
    },
    TaskStarted {
        at: DateTime<Utc>,
        task_id: Uuid,
        agent_id: Uuid,
    },
    TaskProgress {
        at: DateTime<Utc>,
        task_id: Uuid,
        agent_id: Uuid,
        /// 1-based pointer to the active step.
        step: u32,
        /// Floored percentage of done steps.
        progress: u8,
    },
    TaskCompleted {
        at: DateTime<Utc>,
        task_id: Uuid,
        agent_id: Uuid,
    },
    TaskFailed {
        at: DateTime<Utc>,
        task_id: Uuid,
        agent_id: Uuid,
        error: String,
    },
    TaskCancelled {
        at: DateTime<Utc>,
        task_id: Uuid,
        agent_id: Uuid,
        reason: String,
    },
    SolicitationCreated {
        at: DateTime<Utc>,
        solicitation_id: Uuid,
        agent_id: Uuid,
        kind: SolicitationType,
        urgency: Urgency,
    },
    SolicitationResolved {
        at: DateTime<Utc>,
        solicitation_id: Uuid,
        agent_id: Uuid,
        status: SolicitationStatus,
    },
    PortLeased {
        at: DateTime<Utc>,
        port: u16,
        agent_id: Uuid,
        purpose: String,
    },
    PortReleased {
        at: DateTime<Utc>,
        port: u16,
        agent_id: Uuid,
    },
    HubHeartbeat {
        at: DateTime<Utc>,
        agents_running: usize,
    },
}

impl HubEvent {
    /// Stable event name, used as the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentCreated { .. } => "agent_created",
            Self::AgentStatusChanged { .. } => "agent_status_changed",
            Self::AgentMessage { .. } => "agent_message",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::SolicitationCreated { .. } => "solicitation_created",
            Self::SolicitationResolved { .. } => "solicitation_resolved",
            Self::PortLeased { .. } => "port_leased",
            Self::PortReleased { .. } => "port_released",
            Self::HubHeartbeat { .. } => "hub_heartbeat",
        }
    }

    /// When the event occurred.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::AgentCreated { at, .. }
            | Self::AgentStatusChanged { at, .. }
            | Self::AgentMessage { at, .. }
            | Self::TaskCreated { at, .. }
            | Self::TaskStarted { at, .. }
            | Self::TaskProgress { at, .. }
            | Self::TaskCompleted { at, .. }
            | Self::TaskFailed { at, .. }
            | Self::TaskCancelled { at, .. }
            | Self::SolicitationCreated { at, .. }
            | Self::SolicitationResolved { at, .. }
            | Self::PortLeased { at, .. }
            | Self::PortReleased { at, .. }
            | Self::HubHeartbeat { at, .. } => *at,
        }
    }
}

/// Cloneable handle managers use to publish events.
///
/// Emission is non-blocking; the dispatcher's bounded queue is the only
/// boundary between mutators and event consumers.
#[derive(Clone)]
pub struct EventSink {
    dispatcher: Arc<Dispatcher<HubEvent>>,
}

impl EventSink {
    pub fn new(dispatcher: Arc<Dispatcher<HubEvent>>) -> Self {
        Self { dispatcher }
    }

    pub fn emit(&self, event: HubEvent) {
        self.dispatcher.dispatch(event);
    }
}
