//! Solicitations: structured requests for human input raised by agents.
//!
//! A drone that hits a blocker or an ambiguous requirement files a
//! solicitation instead of guessing. The operator answers or dismisses it;
//! either way the record becomes terminal. Pending solicitations are
//! FIFO-ordered per agent.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HubError, InvalidEnumValue, Result};
use crate::event::{EventSink, HubEvent};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What kind of input the agent is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolicitationType {
    Question,
    Blocker,
    Ambiguity,
    Confirmation,
}

impl fmt::Display for SolicitationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Question => "question",
            Self::Blocker => "blocker",
            Self::Ambiguity => "ambiguity",
            Self::Confirmation => "confirmation",
        };
        f.write_str(s)
    }
}

impl FromStr for SolicitationType {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" => Ok(Self::Question),
            "blocker" => Ok(Self::Blocker),
            "ambiguity" => Ok(Self::Ambiguity),
            "confirmation" => Ok(Self::Confirmation),
            other => Err(InvalidEnumValue::new("solicitation type", other)),
        }
    }
}

/// How quickly the agent needs an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl FromStr for Urgency {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(InvalidEnumValue::new("urgency", other)),
        }
    }
}

/// Lifecycle of a solicitation; everything except `pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolicitationStatus {
    Pending,
    Responded,
    Dismissed,
    Expired,
}

impl SolicitationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for SolicitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Responded => "responded",
            Self::Dismissed => "dismissed",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for SolicitationStatus {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "responded" => Ok(Self::Responded),
            "dismissed" => Ok(Self::Dismissed),
            "expired" => Ok(Self::Expired),
            other => Err(InvalidEnumValue::new("solicitation status", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A request for human input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solicitation {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    #[serde(rename = "type")]
    pub kind: SolicitationType,
    pub urgency: Urgency,
    pub message: String,
    pub context: Option<String>,
    pub status: SolicitationStatus,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// Input for [`SolicitationManager::create`].
#[derive(Debug, Clone)]
pub struct CreateSolicitationRequest {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub kind: SolicitationType,
    pub urgency: Urgency,
    pub message: String,
    pub context: Option<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SolicitationState {
    by_id: HashMap<Uuid, Solicitation>,
    /// Global creation order; drives the per-agent FIFO views.
    order: Vec<Uuid>,
}

/// Owns all solicitation records. The only mutator of its map.
pub struct SolicitationManager {
    state: std::sync::RwLock<SolicitationState>,
    events: EventSink,
}

impl SolicitationManager {
    pub fn new(events: EventSink) -> Self {
        Self {
            state: std::sync::RwLock::new(SolicitationState::default()),
            events,
        }
    }

    /// File a new solicitation; returns the stored record.
    pub fn create(&self, req: CreateSolicitationRequest) -> Result<Solicitation> {
        if req.message.trim().is_empty() {
            return Err(HubError::InvalidArgument(
                "solicitation message must not be empty".into(),
            ));
        }

        let solicitation = Solicitation {
            id: Uuid::new_v4(),
            agent_id: req.agent_id,
            agent_name: req.agent_name,
            kind: req.kind,
            urgency: req.urgency,
            message: req.message,
            context: req.context,
            status: SolicitationStatus::Pending,
            response: None,
            created_at: Utc::now(),
            responded_at: None,
        };

        {
            let mut state = self.state.write().expect("solicitation lock poisoned");
            state.by_id.insert(solicitation.id, solicitation.clone());
            state.order.push(solicitation.id);
        }

        self.events.emit(HubEvent::SolicitationCreated {
            at: solicitation.created_at,
            solicitation_id: solicitation.id,
            agent_id: solicitation.agent_id,
            kind: solicitation.kind,
            urgency: solicitation.urgency,
        });

        tracing::info!(
            solicitation_id = %solicitation.id,
            agent = %solicitation.agent_name,
            urgency = %solicitation.urgency,
            "solicitation created"
        );

        Ok(solicitation)
    }

    /// Answer a pending solicitation.
    pub fn respond(&self, id: Uuid, response: impl Into<String>) -> Result<Solicitation> {
        self.resolve(id, SolicitationStatus::Responded, Some(response.into()))
    }

    /// Dismiss a pending solicitation without answering.
    pub fn dismiss(&self, id: Uuid) -> Result<Solicitation> {
        self.resolve(id, SolicitationStatus::Dismissed, None)
    }

    fn resolve(
        &self,
        id: Uuid,
        status: SolicitationStatus,
        response: Option<String>,
    ) -> Result<Solicitation> {
        let resolved = {
            let mut state = self.state.write().expect("solicitation lock poisoned");
            let entry = state
                .by_id
                .get_mut(&id)
                .ok_or_else(|| HubError::NotFound(format!("solicitation {id}")))?;

            if entry.status.is_terminal() {
                return Err(HubError::FailedPrecondition(format!(
                    "solicitation {id} already resolved ({})",
                    entry.status
                )));
            }

            entry.status = status;
            entry.response = response;
            entry.responded_at = Some(Utc::now());
            entry.clone()
        };

        self.events.emit(HubEvent::SolicitationResolved {
            at: resolved.responded_at.unwrap_or_else(Utc::now),
            solicitation_id: resolved.id,
            agent_id: resolved.agent_id,
            status: resolved.status,
        });

        Ok(resolved)
    }

    pub fn get(&self, id: Uuid) -> Result<Solicitation> {
        let state = self.state.read().expect("solicitation lock poisoned");
        state
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("solicitation {id}")))
    }

    /// Pending solicitations in creation order, optionally scoped to one agent.
    pub fn list_pending(&self, agent_id: Option<Uuid>) -> Vec<Solicitation> {
        let state = self.state.read().expect("solicitation lock poisoned");
        state
            .order
            .iter()
            .filter_map(|id| state.by_id.get(id))
            .filter(|s| s.status == SolicitationStatus::Pending)
            .filter(|s| agent_id.is_none_or(|a| s.agent_id == a))
            .cloned()
            .collect()
    }

    /// Every solicitation in creation order (for observer snapshots).
    pub fn list_all(&self) -> Vec<Solicitation> {
        let state = self.state.read().expect("solicitation lock poisoned");
        state
            .order
            .iter()
            .filter_map(|id| state.by_id.get(id))
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.read().expect("solicitation lock poisoned");
        state
            .by_id
            .values()
            .filter(|s| s.status == SolicitationStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Dispatcher;
    use std::sync::Arc;

    fn manager() -> SolicitationManager {
        let dispatcher = Arc::new(Dispatcher::noop());
        SolicitationManager::new(EventSink::new(dispatcher))
    }

    fn request(agent_id: Uuid, message: &str) -> CreateSolicitationRequest {
        CreateSolicitationRequest {
            agent_id,
            agent_name: "drone-1".into(),
            kind: SolicitationType::Question,
            urgency: Urgency::High,
            message: message.into(),
            context: None,
        }
    }

    #[test]
    fn create_then_respond() {
        let mgr = manager();
        let agent = Uuid::new_v4();
        let s = mgr.create(request(agent, "which port?")).unwrap();
        assert_eq!(s.status, SolicitationStatus::Pending);

        let answered = mgr.respond(s.id, "3000").unwrap();
        assert_eq!(answered.status, SolicitationStatus::Responded);
        assert_eq!(answered.response.as_deref(), Some("3000"));
        assert!(answered.responded_at.is_some());
    }

    #[test]
    fn second_respond_is_rejected() {
        let mgr = manager();
        let s = mgr.create(request(Uuid::new_v4(), "?")).unwrap();
        mgr.respond(s.id, "a").unwrap();
        let err = mgr.respond(s.id, "b").unwrap_err();
        assert!(matches!(err, HubError::FailedPrecondition(_)));
    }

    #[test]
    fn dismiss_is_terminal() {
        let mgr = manager();
        let s = mgr.create(request(Uuid::new_v4(), "?")).unwrap();
        let dismissed = mgr.dismiss(s.id).unwrap();
        assert_eq!(dismissed.status, SolicitationStatus::Dismissed);
        assert!(mgr.dismiss(s.id).is_err());
    }

    #[test]
    fn empty_message_rejected() {
        let mgr = manager();
        let err = mgr.create(request(Uuid::new_v4(), "  ")).unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));
    }

    #[test]
    fn list_pending_is_fifo_per_agent() {
        let mgr = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let first = mgr.create(request(a, "first")).unwrap();
        let _other = mgr.create(request(b, "other")).unwrap();
        let second = mgr.create(request(a, "second")).unwrap();

        let pending = mgr.list_pending(Some(a));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);

        mgr.respond(first.id, "ok").unwrap();
        assert_eq!(mgr.list_pending(Some(a)).len(), 1);
        assert_eq!(mgr.pending_count(), 2);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let mgr = manager();
        assert!(matches!(
            mgr.respond(Uuid::new_v4(), "x").unwrap_err(),
            HubError::NotFound(_)
        ));
    }
}
