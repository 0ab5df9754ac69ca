//! Task lifecycle manager.
//!
//! Owns every task record plus the per-agent assignment order. All
//! mutators hold the single write lock for the duration of the state
//! change, then emit events after the lock is released. Terminal tasks
//! reject every further mutation.
//!
//! The transition graph:
//!
//! ```text
//! assigned    -> in_progress           (start)
//! in_progress -> waiting               (step reports waiting/blocked)
//! waiting     -> in_progress           (step resumes)
//! in_progress | waiting -> completed   (explicit complete)
//! in_progress | waiting -> failed      (fail)
//! any non-terminal      -> cancelled   (cancel)
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use super::{Artifact, Plan, Step, StepAutonomy, StepStatus, Task, TaskStatus};
use crate::error::{HubError, Result};
use crate::event::{EventSink, HubEvent};

/// One step of an incoming plan, before ids are assigned.
#[derive(Debug, Clone, Default)]
pub struct StepSpec {
    pub action: String,
    pub description: String,
    pub dod: Vec<String>,
    pub autonomy: Option<StepAutonomy>,
}

/// Input for [`TaskManager::create`].
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub agent_id: Uuid,
    pub title: String,
    pub description: String,
    pub context: String,
    pub required_ports: Vec<u16>,
    pub steps: Vec<StepSpec>,
}

/// Requested mutation of one step.
#[derive(Debug, Clone)]
pub struct StepChange {
    pub status: StepStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct TaskState {
    tasks: HashMap<Uuid, Task>,
    /// Task ids per agent in creation order.
    by_agent: HashMap<Uuid, Vec<Uuid>>,
}

/// Owns all task records; the only mutator of its maps.
pub struct TaskManager {
    state: RwLock<TaskState>,
    events: EventSink,
}

impl TaskManager {
    pub fn new(events: EventSink) -> Self {
        Self {
            state: RwLock::new(TaskState::default()),
            events,
        }
    }

    /// Validate and register a new task in `assigned` state.
    ///
    /// `agent_name` is resolved by the caller so this manager never has to
    /// reach into the agent manager.
    pub fn create(&self, req: CreateTaskRequest, agent_name: &str) -> Result<Task> {
        if req.title.trim().is_empty() {
            return Err(HubError::InvalidArgument("task title must not be empty".into()));
        }
        if req.steps.is_empty() {
            return Err(HubError::InvalidArgument(
                "task must have at least one step (steps is empty)".into(),
            ));
        }
        for (i, spec) in req.steps.iter().enumerate() {
            if spec.action.trim().is_empty() {
                return Err(HubError::InvalidArgument(format!(
                    "step {} has no action",
                    i + 1
                )));
            }
            if spec.dod.is_empty() {
                return Err(HubError::InvalidArgument(format!(
                    "step {} has an empty definition of done",
                    i + 1
                )));
            }
        }

        let steps: Vec<Step> = req
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Step {
                id: (i + 1) as u32,
                action: spec.action,
                description: spec.description,
                dod: spec.dod,
                autonomy: spec.autonomy.unwrap_or_default(),
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .collect();

        let task = Task {
            id: Uuid::new_v4(),
            agent_id: req.agent_id,
            agent_name: agent_name.to_string(),
            plan: Plan {
                id: Uuid::new_v4(),
                title: req.title,
                description: req.description,
                context: req.context,
                required_ports: req.required_ports,
                steps,
            },
            status: TaskStatus::Assigned,
            current_step: 0,
            result: None,
            artifacts: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        {
            let mut state = self.state.write().expect("task lock poisoned");
            state.tasks.insert(task.id, task.clone());
            state.by_agent.entry(task.agent_id).or_default().push(task.id);
        }

        self.events.emit(HubEvent::TaskCreated {
            at: task.created_at,
            task_id: task.id,
            agent_id: task.agent_id,
            title: task.plan.title.clone(),
        });

        tracing::info!(task_id = %task.id, agent = %task.agent_name, "task created");
        Ok(task)
    }

    /// Begin execution: `assigned -> in_progress`, step 1 active.
    pub fn start(&self, task_id: Uuid) -> Result<Task> {
        let task = {
            let mut state = self.state.write().expect("task lock poisoned");
            let task = get_mut(&mut state, task_id)?;
            if task.status != TaskStatus::Assigned {
                return Err(HubError::FailedPrecondition(format!(
                    "task {task_id} is {}, expected assigned",
                    task.status
                )));
            }
            let now = Utc::now();
            task.status = TaskStatus::InProgress;
            task.current_step = 1;
            task.started_at = Some(now);
            let first = &mut task.plan.steps[0];
            first.status = StepStatus::InProgress;
            first.started_at = Some(now);
            task.clone()
        };

        self.events.emit(HubEvent::TaskStarted {
            at: task.started_at.unwrap_or_else(Utc::now),
            task_id: task.id,
            agent_id: task.agent_id,
        });
        Ok(task)
    }

    /// Apply a status change to one step.
    ///
    /// Completing a non-final step advances `current_step` and activates
    /// the next step. Completing the final step leaves the task
    /// `in_progress`: only an explicit [`TaskManager::complete`] finishes
    /// a task. A step reporting `waiting` or `blocked` parks the whole
    /// task in `waiting`.
    pub fn update_step(&self, task_id: Uuid, step_id: u32, change: StepChange) -> Result<Task> {
        let task = {
            let mut state = self.state.write().expect("task lock poisoned");
            let task = get_mut(&mut state, task_id)?;
            ensure_mutable(task)?;

            let step_count = task.plan.steps.len() as u32;
            if step_id < 1 || step_id > step_count {
                return Err(HubError::InvalidArgument(format!(
                    "invalid step {step_id}: task has steps 1..={step_count}"
                )));
            }

            let now = Utc::now();
            let idx = (step_id - 1) as usize;
            {
                let step = &mut task.plan.steps[idx];
                step.status = change.status;
                if change.result.is_some() {
                    step.result = change.result;
                }
                if change.error.is_some() {
                    step.error = change.error;
                }
                match change.status {
                    StepStatus::InProgress => {
                        if step.started_at.is_none() {
                            step.started_at = Some(now);
                        }
                    }
                    StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                        step.completed_at = Some(now);
                    }
                    StepStatus::Pending | StepStatus::Waiting | StepStatus::Blocked => {}
                }
            }

            match change.status {
                StepStatus::Waiting | StepStatus::Blocked => {
                    task.status = TaskStatus::Waiting;
                }
                StepStatus::InProgress => {
                    task.status = TaskStatus::InProgress;
                }
                StepStatus::Completed => {
                    // Advance to the next step when the active one finishes.
                    if step_id == task.current_step && step_id < step_count {
                        task.current_step = step_id + 1;
                        let next = &mut task.plan.steps[step_id as usize];
                        next.status = StepStatus::InProgress;
                        next.started_at = Some(now);
                    }
                    task.status = TaskStatus::InProgress;
                }
                StepStatus::Failed | StepStatus::Skipped | StepStatus::Pending => {}
            }

            task.clone()
        };

        self.emit_progress(&task);
        Ok(task)
    }

    /// Finalize a task: the active step completes, stragglers are skipped,
    /// and progress reaches 100.
    pub fn complete(
        &self,
        task_id: Uuid,
        result: Option<String>,
        artifacts: Vec<Artifact>,
    ) -> Result<Task> {
        let task = {
            let mut state = self.state.write().expect("task lock poisoned");
            let task = get_mut(&mut state, task_id)?;
            ensure_mutable(task)?;

            let now = Utc::now();
            for step in &mut task.plan.steps {
                match step.status {
                    StepStatus::Completed | StepStatus::Skipped => {}
                    StepStatus::InProgress | StepStatus::Waiting | StepStatus::Blocked => {
                        if step.id == task.current_step {
                            step.status = StepStatus::Completed;
                        } else {
                            step.status = StepStatus::Skipped;
                        }
                        step.completed_at = Some(now);
                    }
                    StepStatus::Pending | StepStatus::Failed => {
                        step.status = StepStatus::Skipped;
                        step.completed_at = Some(now);
                    }
                }
            }
            task.status = TaskStatus::Completed;
            task.result = result;
            task.artifacts = artifacts;
            task.completed_at = Some(now);
            task.clone()
        };

        self.events.emit(HubEvent::TaskCompleted {
            at: task.completed_at.unwrap_or_else(Utc::now),
            task_id: task.id,
            agent_id: task.agent_id,
        });
        tracing::info!(task_id = %task.id, "task completed");
        Ok(task)
    }

    /// Mark a task failed; the active step carries the error.
    pub fn fail(&self, task_id: Uuid, error: impl Into<String>) -> Result<Task> {
        let error = error.into();
        let task = {
            let mut state = self.state.write().expect("task lock poisoned");
            let task = get_mut(&mut state, task_id)?;
            ensure_mutable(task)?;

            let now = Utc::now();
            if task.current_step >= 1 {
                let step = &mut task.plan.steps[(task.current_step - 1) as usize];
                if !matches!(step.status, StepStatus::Completed | StepStatus::Skipped) {
                    step.status = StepStatus::Failed;
                    step.error = Some(error.clone());
                    step.completed_at = Some(now);
                }
            }
            task.status = TaskStatus::Failed;
            task.error = Some(error.clone());
            task.completed_at = Some(now);
            task.clone()
        };

        self.events.emit(HubEvent::TaskFailed {
            at: task.completed_at.unwrap_or_else(Utc::now),
            task_id: task.id,
            agent_id: task.agent_id,
            error,
        });
        tracing::warn!(task_id = %task.id, "task failed");
        Ok(task)
    }

    /// Cancel a non-terminal task.
    pub fn cancel(&self, task_id: Uuid, reason: impl Into<String>) -> Result<Task> {
        let reason = reason.into();
        let task = {
            let mut state = self.state.write().expect("task lock poisoned");
            let task = get_mut(&mut state, task_id)?;
            ensure_mutable(task)?;

            task.status = TaskStatus::Cancelled;
            task.error = Some(reason.clone());
            task.completed_at = Some(Utc::now());
            task.clone()
        };

        self.events.emit(HubEvent::TaskCancelled {
            at: task.completed_at.unwrap_or_else(Utc::now),
            task_id: task.id,
            agent_id: task.agent_id,
            reason,
        });
        Ok(task)
    }

    /// Cancel every non-terminal task of an agent; returns how many were
    /// cancelled. Used when the agent is stopped or destroyed.
    pub fn cancel_all_for_agent(&self, agent_id: Uuid, reason: &str) -> usize {
        let ids: Vec<Uuid> = {
            let state = self.state.read().expect("task lock poisoned");
            state
                .by_agent
                .get(&agent_id)
                .map(|ids| {
                    ids.iter()
                        .filter(|id| {
                            state
                                .tasks
                                .get(id)
                                .is_some_and(|t| !t.is_terminal())
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut cancelled = 0;
        for id in ids {
            // A task may have reached a terminal state between the scan and
            // this call; those are skipped, not errors.
            if self.cancel(id, reason).is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn get(&self, task_id: Uuid) -> Result<Task> {
        let state = self.state.read().expect("task lock poisoned");
        state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))
    }

    /// All tasks in creation order.
    pub fn list(&self) -> Vec<Task> {
        let state = self.state.read().expect("task lock poisoned");
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// The most recent non-terminal task assigned to `agent_id`.
    pub fn get_by_agent(&self, agent_id: Uuid) -> Option<Task> {
        let state = self.state.read().expect("task lock poisoned");
        state.by_agent.get(&agent_id).and_then(|ids| {
            ids.iter()
                .rev()
                .filter_map(|id| state.tasks.get(id))
                .find(|t| !t.is_terminal())
                .cloned()
        })
    }

    pub fn count(&self) -> usize {
        let state = self.state.read().expect("task lock poisoned");
        state.tasks.len()
    }

    fn emit_progress(&self, task: &Task) {
        self.events.emit(HubEvent::TaskProgress {
            at: Utc::now(),
            task_id: task.id,
            agent_id: task.agent_id,
            step: task.current_step,
            progress: task.progress(),
        });
    }
}

fn get_mut(state: &mut TaskState, task_id: Uuid) -> Result<&mut Task> {
    state
        .tasks
        .get_mut(&task_id)
        .ok_or_else(|| HubError::NotFound(format!("task {task_id}")))
}

fn ensure_mutable(task: &Task) -> Result<()> {
    if task.is_terminal() {
        return Err(HubError::FailedPrecondition(format!(
            "task {} is {} and frozen",
            task.id, task.status
        )));
    }
    Ok(())
}
