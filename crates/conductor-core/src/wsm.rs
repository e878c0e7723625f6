//! Workflow State Machine: the single source of truth for where a task is in
//! its lifecycle and which transitions are legal.
//!
//! Mirrors the state-bookkeeping shape of an execution-status map behind a
//! lock, generalised from a per-task status enum to the full workflow
//! lifecycle, with a typed transition table instead of an open set of
//! statuses.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::storage::StorageAdapter;

const MAX_HISTORY: usize = 100;

/// The 13 lifecycle states a task traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Idle,
    Planning,
    PlanReview,
    PlanRevision,
    StructureCreation,
    CodeImplementation,
    CodeReview,
    CodeFixing,
    Documentation,
    Testing,
    Completed,
    Paused,
    Error,
}

/// The nine states in which the workflow is actively doing work — the states
/// `pause_requested`/`cancel_requested`/`error_occurred` apply from.
const ACTIVE_STATES: [WorkflowState; 9] = [
    WorkflowState::Planning,
    WorkflowState::PlanReview,
    WorkflowState::PlanRevision,
    WorkflowState::StructureCreation,
    WorkflowState::CodeImplementation,
    WorkflowState::CodeReview,
    WorkflowState::CodeFixing,
    WorkflowState::Documentation,
    WorkflowState::Testing,
];

/// Explicit (from, trigger, to) edges of the transition table, excluding the
/// blanket pause/cancel/error rules which apply across every active state.
const EDGES: &[(WorkflowState, &str, WorkflowState)] = {
    use WorkflowState::{
        CodeFixing, CodeImplementation, CodeReview, Completed, Documentation, Error, Idle,
        PlanRevision, PlanReview, Planning, StructureCreation, Testing,
    };
    &[
        (Idle, "start_task", Planning),
        (Planning, "plan_created", PlanReview),
        (PlanReview, "plan_approved", StructureCreation),
        (PlanReview, "plan_needs_revision", PlanRevision),
        (PlanRevision, "plan_revised", PlanReview),
        (StructureCreation, "structure_created", CodeImplementation),
        (CodeImplementation, "code_implemented", CodeReview),
        (CodeReview, "code_approved", Documentation),
        (CodeReview, "code_needs_fixes", CodeFixing),
        (CodeFixing, "code_fixed", CodeReview),
        (Documentation, "documentation_complete", Testing),
        (Testing, "tests_passed", Completed),
        (Testing, "tests_failed", CodeFixing),
        (Error, "retry_requested", Planning),
        (Error, "cancel_requested", Idle),
        (Completed, "cancel_requested", Idle),
    ]
};

impl WorkflowState {
    fn is_active(self) -> bool {
        ACTIVE_STATES.contains(&self)
    }

    /// Fixed progress mapping, monotone non-decreasing along any happy path.
    /// -1 signals "not meaningfully measurable" for PAUSED/ERROR.
    #[must_use]
    pub fn progress(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Planning => 10,
            Self::PlanRevision => 15,
            Self::PlanReview => 20,
            Self::StructureCreation => 30,
            Self::CodeFixing => 50,
            Self::CodeImplementation => 45,
            Self::CodeReview => 60,
            Self::Documentation => 75,
            Self::Testing => 85,
            Self::Completed => 100,
            Self::Paused | Self::Error => -1,
        }
    }
}

/// Mutable state of one task, owned by the WSM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub user_task: String,
    pub current_step: u32,
    pub total_steps: u32,
    pub artifact_ids: Vec<String>,
    pub agent_ids: Vec<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub metadata: serde_json::Map<String, Value>,
}

impl WorkflowContext {
    fn push_artifact(&mut self, artifact_id: impl Into<String>) {
        let id = artifact_id.into();
        if !self.artifact_ids.contains(&id) {
            self.artifact_ids.push(id);
        }
    }

    fn push_agent(&mut self, agent_id: impl Into<String>) {
        let id = agent_id.into();
        if !self.agent_ids.contains(&id) {
            self.agent_ids.push(id);
        }
    }
}

/// One append-only audit record. Bounded to [`MAX_HISTORY`] entries, oldest
/// evicted first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub trigger: Option<String>,
    pub metadata: Option<Value>,
}

/// Events emitted by the WSM. Modeled as a `broadcast` channel per the
/// project's "event emitters become message passing" convention rather than
/// an in-process listener registry.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    StateChange {
        previous_state: WorkflowState,
        new_state: WorkflowState,
        trigger: Option<String>,
        timestamp: DateTime<Utc>,
        context: WorkflowContext,
    },
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    state: WorkflowState,
    previous_state: Option<WorkflowState>,
    context: WorkflowContext,
    history: Vec<StateHistoryEntry>,
}

struct Inner {
    state: WorkflowState,
    previous_state: Option<WorkflowState>,
    context: WorkflowContext,
    history: VecDeque<StateHistoryEntry>,
}

/// Authoritative lifecycle tracker for one task.
pub struct WorkflowStateMachine {
    inner: RwLock<Inner>,
    events: broadcast::Sender<WorkflowEvent>,
    storage: Option<Arc<dyn StorageAdapter>>,
    storage_key: String,
}

impl std::fmt::Debug for WorkflowStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self
            .inner
            .try_read()
            .map(|i| i.state)
            .unwrap_or(WorkflowState::Idle);
        f.debug_struct("WorkflowStateMachine")
            .field("state", &snapshot)
            .field("storage_key", &self.storage_key)
            .finish_non_exhaustive()
    }
}

impl WorkflowStateMachine {
    /// Creates a fresh, unpersisted state machine in `IDLE`.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(Inner {
                state: WorkflowState::Idle,
                previous_state: None,
                context: WorkflowContext::default(),
                history: VecDeque::new(),
            }),
            events,
            storage: None,
            storage_key: format!("wsm:{}", session_id.into()),
        }
    }

    /// Creates a state machine backed by a storage adapter, restoring the
    /// last persisted snapshot if one exists.
    pub async fn with_storage(
        session_id: impl Into<String>,
        storage: Arc<dyn StorageAdapter>,
    ) -> Self {
        let mut machine = Self::new(session_id);
        let key = machine.storage_key.clone();
        match storage.get_item(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(persisted) => {
                    let mut inner = machine.inner.write().await;
                    inner.state = persisted.state;
                    inner.previous_state = persisted.previous_state;
                    inner.context = persisted.context;
                    inner.history = persisted.history.into_iter().collect();
                }
                Err(err) => warn!(%err, "failed to deserialize persisted workflow state"),
            },
            Ok(None) => {}
            Err(err) => warn!(%err, "failed to read persisted workflow state"),
        }
        machine.storage = Some(storage);
        machine
    }

    /// Subscribes to `stateChange`/`reset` events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// `IDLE` → `PLANNING`.
    pub async fn start_task(&self, user_task: impl Into<String>) -> Result<WorkflowState> {
        {
            let inner = self.inner.read().await;
            if inner.state != WorkflowState::Idle {
                return Err(CoreError::InvalidLifecycleOp {
                    op: "start_task",
                    state: inner.state,
                });
            }
        }
        {
            let mut inner = self.inner.write().await;
            inner.context = WorkflowContext {
                user_task: user_task.into(),
                ..WorkflowContext::default()
            };
        }
        self.do_transition(WorkflowState::Planning, Some("start_task"), None)
            .await
    }

    /// Enforces the transition table; fails listing the legal targets if the
    /// edge does not exist.
    pub async fn transition(
        &self,
        target: WorkflowState,
        trigger: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<WorkflowState> {
        self.do_transition(target, trigger, metadata).await
    }

    /// Active state → `PAUSED`, recording `previousState`.
    pub async fn pause(&self) -> Result<WorkflowState> {
        {
            let inner = self.inner.read().await;
            if !inner.state.is_active() {
                return Err(CoreError::InvalidLifecycleOp {
                    op: "pause",
                    state: inner.state,
                });
            }
        }
        self.do_transition(WorkflowState::Paused, Some("pause_requested"), None)
            .await
    }

    /// `PAUSED` → recorded `previousState`, clearing it.
    pub async fn resume(&self) -> Result<WorkflowState> {
        let target = {
            let inner = self.inner.read().await;
            if inner.state != WorkflowState::Paused {
                return Err(CoreError::InvalidLifecycleOp {
                    op: "resume",
                    state: inner.state,
                });
            }
            inner.previous_state.unwrap_or(WorkflowState::Idle)
        };
        self.do_transition(target, Some("resume_requested"), None)
            .await
    }

    /// Active/`ERROR`/`COMPLETED` → `IDLE`, clearing the context.
    pub async fn cancel(&self) -> Result<WorkflowState> {
        {
            let inner = self.inner.read().await;
            let ok = inner.state.is_active()
                || inner.state == WorkflowState::Error
                || inner.state == WorkflowState::Completed;
            if !ok {
                return Err(CoreError::InvalidLifecycleOp {
                    op: "cancel",
                    state: inner.state,
                });
            }
        }
        let result = self
            .do_transition(WorkflowState::Idle, Some("cancel_requested"), None)
            .await;
        if result.is_ok() {
            let mut inner = self.inner.write().await;
            inner.context = WorkflowContext::default();
        }
        result
    }

    /// `ERROR` → `PLANNING`, incrementing `retryCount` and clearing
    /// `errorMessage`.
    pub async fn retry(&self) -> Result<WorkflowState> {
        {
            let inner = self.inner.read().await;
            if inner.state != WorkflowState::Error {
                return Err(CoreError::InvalidLifecycleOp {
                    op: "retry",
                    state: inner.state,
                });
            }
        }
        self.do_transition(WorkflowState::Planning, Some("retry_requested"), None)
            .await
    }

    /// Marks the workflow as failed. Allowed from any active state.
    pub async fn handle_error(&self, error_message: impl Into<String>) -> Result<WorkflowState> {
        {
            let inner = self.inner.read().await;
            if !inner.state.is_active() {
                return Err(CoreError::InvalidLifecycleOp {
                    op: "error_occurred",
                    state: inner.state,
                });
            }
        }
        {
            let mut inner = self.inner.write().await;
            inner.context.error_message = Some(error_message.into());
        }
        self.do_transition(WorkflowState::Error, Some("error_occurred"), None)
            .await
    }

    /// Convenience trigger selecting the canonical next state for a newly
    /// created artifact.
    pub async fn handle_artifact_created(&self, artifact_type: &str) -> Result<WorkflowState> {
        let current = self.get_state().await;
        let (target, trigger) = match (current, artifact_type) {
            (WorkflowState::Planning, "implementation_plan") => {
                (WorkflowState::PlanReview, "plan_created")
            }
            (WorkflowState::StructureCreation, _) => {
                (WorkflowState::CodeImplementation, "structure_created")
            }
            (WorkflowState::CodeImplementation, "code") => {
                (WorkflowState::CodeReview, "code_implemented")
            }
            (WorkflowState::CodeFixing, "code") => (WorkflowState::CodeReview, "code_fixed"),
            (WorkflowState::Documentation, "documentation") => {
                (WorkflowState::Testing, "documentation_complete")
            }
            _ => {
                return Err(CoreError::InvalidLifecycleOp {
                    op: "handle_artifact_created",
                    state: current,
                })
            }
        };
        {
            let mut inner = self.inner.write().await;
            inner.context.push_artifact(artifact_type);
        }
        self.do_transition(target, Some(trigger), None).await
    }

    /// `PLAN_REVIEW` → `STRUCTURE_CREATION` or `PLAN_REVISION`.
    pub async fn handle_plan_review(&self, approved: bool) -> Result<WorkflowState> {
        let current = self.get_state().await;
        if current != WorkflowState::PlanReview {
            return Err(CoreError::InvalidLifecycleOp {
                op: "handle_plan_review",
                state: current,
            });
        }
        if approved {
            self.do_transition(WorkflowState::StructureCreation, Some("plan_approved"), None)
                .await
        } else {
            self.do_transition(WorkflowState::PlanRevision, Some("plan_needs_revision"), None)
                .await
        }
    }

    /// `CODE_REVIEW` → `DOCUMENTATION` or `CODE_FIXING`.
    pub async fn handle_code_review(&self, approved: bool) -> Result<WorkflowState> {
        let current = self.get_state().await;
        if current != WorkflowState::CodeReview {
            return Err(CoreError::InvalidLifecycleOp {
                op: "handle_code_review",
                state: current,
            });
        }
        if approved {
            self.do_transition(WorkflowState::Documentation, Some("code_approved"), None)
                .await
        } else {
            self.do_transition(WorkflowState::CodeFixing, Some("code_needs_fixes"), None)
                .await
        }
    }

    /// `TESTING` → `COMPLETED` or `CODE_FIXING`.
    pub async fn handle_test_results(&self, passed: bool) -> Result<WorkflowState> {
        let current = self.get_state().await;
        if current != WorkflowState::Testing {
            return Err(CoreError::InvalidLifecycleOp {
                op: "handle_test_results",
                state: current,
            });
        }
        if passed {
            self.do_transition(WorkflowState::Completed, Some("tests_passed"), None)
                .await
        } else {
            self.do_transition(WorkflowState::CodeFixing, Some("tests_failed"), None)
                .await
        }
    }

    /// Records that `agent_id` was spawned for the current task.
    pub async fn record_agent(&self, agent_id: impl Into<String>) {
        self.inner.write().await.context.push_agent(agent_id);
    }

    pub async fn get_state(&self) -> WorkflowState {
        self.inner.read().await.state
    }

    pub async fn get_previous_state(&self) -> Option<WorkflowState> {
        self.inner.read().await.previous_state
    }

    pub async fn get_context(&self) -> WorkflowContext {
        self.inner.read().await.context.clone()
    }

    pub async fn get_history(&self, limit: Option<usize>) -> Vec<StateHistoryEntry> {
        let inner = self.inner.read().await;
        match limit {
            Some(n) => inner.history.iter().rev().take(n).rev().cloned().collect(),
            None => inner.history.iter().cloned().collect(),
        }
    }

    pub async fn get_progress(&self) -> i32 {
        self.inner.read().await.state.progress()
    }

    pub async fn can_transition_to(&self, target: WorkflowState) -> bool {
        let current = self.get_state().await;
        Self::edge_exists(current, target)
    }

    pub async fn get_valid_transitions(&self) -> Vec<WorkflowState> {
        let current = self.get_state().await;
        let mut targets: Vec<WorkflowState> = EDGES
            .iter()
            .filter(|(from, _, _)| *from == current)
            .map(|(_, _, to)| *to)
            .collect();
        if current.is_active() {
            targets.push(WorkflowState::Paused);
            targets.push(WorkflowState::Idle);
            targets.push(WorkflowState::Error);
        }
        targets.sort_by_key(|s| format!("{s:?}"));
        targets.dedup();
        targets
    }

    pub async fn is_active(&self) -> bool {
        self.get_state().await.is_active()
    }

    pub async fn is_paused(&self) -> bool {
        self.get_state().await == WorkflowState::Paused
    }

    pub async fn has_error(&self) -> bool {
        self.get_state().await == WorkflowState::Error
    }

    pub async fn is_terminal_state(&self) -> bool {
        matches!(self.get_state().await, WorkflowState::Completed)
    }

    /// Force-sets state and context from a checkpoint restore, bypassing the
    /// transition table — a rollback may jump backward across edges that
    /// only ever run forward. Used exclusively by the checkpoint bridge's
    /// rollback path, never by ordinary workflow triggers.
    pub async fn restore_snapshot(&self, state: WorkflowState, context: WorkflowContext) {
        let (previous, now) = {
            let mut inner = self.inner.write().await;
            let previous = inner.state;
            inner.state = state;
            inner.previous_state = None;
            inner.context = context;
            let now = Utc::now();
            inner.history.push_back(StateHistoryEntry {
                state,
                timestamp: now,
                trigger: Some("rollback_restored".to_string()),
                metadata: None,
            });
            while inner.history.len() > MAX_HISTORY {
                inner.history.pop_front();
            }
            (previous, now)
        };

        debug!(?previous, target = ?state, "workflow state restored from checkpoint");
        self.persist().await;

        let context = self.get_context().await;
        let _ = self.events.send(WorkflowEvent::StateChange {
            previous_state: previous,
            new_state: state,
            trigger: Some("rollback_restored".to_string()),
            timestamp: now,
            context,
        });
    }

    /// Resets to a brand-new `IDLE` workflow, clearing context and history.
    pub async fn reset(&self) {
        {
            let mut inner = self.inner.write().await;
            inner.state = WorkflowState::Idle;
            inner.previous_state = None;
            inner.context = WorkflowContext::default();
            inner.history.clear();
        }
        self.persist().await;
        let _ = self.events.send(WorkflowEvent::Reset);
    }

    fn edge_exists(current: WorkflowState, target: WorkflowState) -> bool {
        if EDGES.iter().any(|(from, _, to)| *from == current && *to == target) {
            return true;
        }
        if current.is_active() {
            if target == WorkflowState::Paused || target == WorkflowState::Error {
                return true;
            }
            if target == WorkflowState::Idle {
                return true;
            }
        }
        false
    }

    async fn do_transition(
        &self,
        target: WorkflowState,
        trigger: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<WorkflowState> {
        let (previous, now) = {
            let mut inner = self.inner.write().await;
            let current = inner.state;
            if !Self::edge_exists(current, target) {
                let valid: Vec<WorkflowState> = EDGES
                    .iter()
                    .filter(|(from, _, _)| *from == current)
                    .map(|(_, _, to)| *to)
                    .collect();
                return Err(CoreError::InvalidTransition { from: current, target, valid });
            }

            if target == WorkflowState::Paused {
                inner.previous_state = Some(current);
            } else if current == WorkflowState::Paused {
                inner.previous_state = None;
            }
            if current == WorkflowState::Error && target == WorkflowState::Planning {
                inner.context.retry_count += 1;
                inner.context.error_message = None;
            }

            inner.state = target;
            let now = Utc::now();
            inner.history.push_back(StateHistoryEntry {
                state: target,
                timestamp: now,
                trigger: trigger.map(str::to_string),
                metadata,
            });
            while inner.history.len() > MAX_HISTORY {
                inner.history.pop_front();
            }
            (current, now)
        };

        debug!(?previous, ?target, trigger, "workflow transition");
        self.persist().await;

        let context = self.get_context().await;
        let _ = self.events.send(WorkflowEvent::StateChange {
            previous_state: previous,
            new_state: target,
            trigger: trigger.map(str::to_string),
            timestamp: now,
            context,
        });

        Ok(target)
    }

    async fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let snapshot = {
            let inner = self.inner.read().await;
            PersistedState {
                state: inner.state,
                previous_state: inner.previous_state,
                context: inner.context.clone(),
                history: inner.history.iter().cloned().collect(),
            }
        };
        match serde_json::to_string(&snapshot) {
            Ok(raw) => {
                if let Err(err) = storage.set_item(&self.storage_key, raw).await {
                    warn!(%err, "failed to persist workflow state");
                }
            }
            Err(err) => warn!(%err, "failed to serialize workflow state"),
        }
    }
}
