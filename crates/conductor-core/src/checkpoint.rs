//! Checkpoint service and the bridge that auto-snapshots the Workflow State
//! Machine on significant transitions.
//!
//! Grounded on the teacher's checkpoint module naming and operation shape,
//! adapted from git-backed file snapshots to in-memory snapshots of
//! {workflow state, context, artifact/agent references} persisted through a
//! [`StorageAdapter`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::storage::StorageAdapter;
use crate::wsm::{StateHistoryEntry, WorkflowContext, WorkflowEvent, WorkflowState};

/// Snapshot of the WSM's own fields at checkpoint time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStateSnapshot {
    pub state: WorkflowState,
    pub previous_state: Option<WorkflowState>,
    pub timestamp: DateTime<Utc>,
    pub history: Vec<StateHistoryEntry>,
}

/// Checkpoint lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    Active,
    Restored,
    Expired,
    Deleted,
}

/// An immutable snapshot of a workflow's state + context + references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub id: String,
    pub session_id: String,
    pub workflow_state_snapshot: WorkflowStateSnapshot,
    pub context_snapshot: WorkflowContext,
    pub artifact_refs: Vec<String>,
    pub agent_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub status: CheckpointStatus,
    pub name: Option<String>,
}

/// Filters/pagination for [`CheckpointService::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub session_id: Option<String>,
    pub status: Option<CheckpointStatus>,
    pub tag: Option<String>,
    pub state: Option<WorkflowState>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Which parts of a checkpoint to apply on [`CheckpointService::restore`].
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    pub artifacts: bool,
    pub agents: bool,
    pub context: bool,
    pub history: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { artifacts: true, agents: true, context: true, history: true }
    }
}

/// Age/status-based cleanup options.
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub older_than: Option<DateTime<Utc>>,
    pub statuses: Vec<CheckpointStatus>,
    pub max_per_session: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointStats {
    pub total: usize,
    pub active: usize,
    pub per_session: HashMap<String, usize>,
}

/// The restored payload re-emitted on rollback; consumers re-apply it to
/// their own `WorkflowStateMachine` — the bridge never reaches into the
/// WSM's internals directly.
#[derive(Debug, Clone)]
pub struct RollbackEvent {
    pub checkpoint_id: String,
    pub restored_state: WorkflowState,
    pub restored_context: WorkflowContext,
    pub artifact_refs: Vec<String>,
    pub agent_refs: Vec<String>,
    pub warnings: Vec<String>,
}

struct Inner {
    checkpoints: HashMap<String, WorkflowCheckpoint>,
    by_session: HashMap<String, Vec<String>>,
}

/// Stores immutable workflow checkpoints.
pub struct CheckpointService {
    storage: Arc<dyn StorageAdapter>,
    max_checkpoints_per_session: usize,
    inner: RwLock<Inner>,
}

impl CheckpointService {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageAdapter>, max_checkpoints_per_session: usize) -> Self {
        Self {
            storage,
            max_checkpoints_per_session,
            inner: RwLock::new(Inner { checkpoints: HashMap::new(), by_session: HashMap::new() }),
        }
    }

    pub async fn create_checkpoint_from_workflow(
        &self,
        session_id: impl Into<String>,
        state: WorkflowState,
        previous_state: Option<WorkflowState>,
        history: Vec<StateHistoryEntry>,
        context: WorkflowContext,
        name: Option<String>,
        tags: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<WorkflowCheckpoint> {
        let session_id = session_id.into();
        let checkpoint = WorkflowCheckpoint {
            id: format!("chk_{}", Uuid::new_v4()),
            session_id: session_id.clone(),
            workflow_state_snapshot: WorkflowStateSnapshot {
                state,
                previous_state,
                timestamp: Utc::now(),
                history,
            },
            context_snapshot: context.clone(),
            artifact_refs: context.artifact_ids.clone(),
            agent_refs: context.agent_ids.clone(),
            created_at: Utc::now(),
            expires_at,
            tags,
            status: CheckpointStatus::Active,
            name,
        };

        {
            let mut inner = self.inner.write().await;
            inner.checkpoints.insert(checkpoint.id.clone(), checkpoint.clone());
            inner.by_session.entry(session_id.clone()).or_default().push(checkpoint.id.clone());
        }
        self.persist_one(&checkpoint).await;
        self.enforce_session_cap(&session_id).await;
        debug!(checkpoint_id = %checkpoint.id, %session_id, "checkpoint created");
        Ok(checkpoint)
    }

    async fn enforce_session_cap(&self, session_id: &str) {
        let overflow: Vec<String> = {
            let inner = self.inner.read().await;
            let Some(ids) = inner.by_session.get(session_id) else {
                return;
            };
            if ids.len() <= self.max_checkpoints_per_session {
                return;
            }
            let excess = ids.len() - self.max_checkpoints_per_session;
            ids.iter().take(excess).cloned().collect()
        };
        for id in overflow {
            let _ = self.delete(&id).await;
        }
    }

    pub async fn get_latest(&self, session_id: &str) -> Option<WorkflowCheckpoint> {
        let inner = self.inner.read().await;
        inner
            .by_session
            .get(session_id)?
            .iter()
            .filter_map(|id| inner.checkpoints.get(id))
            .filter(|c| c.status == CheckpointStatus::Active)
            .max_by_key(|c| c.created_at)
            .cloned()
    }

    pub async fn get_checkpoints_for_state(
        &self,
        session_id: &str,
        state: WorkflowState,
    ) -> Vec<WorkflowCheckpoint> {
        let inner = self.inner.read().await;
        inner
            .by_session
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.checkpoints.get(id))
                    .filter(|c| c.workflow_state_snapshot.state == state)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn list(&self, options: ListOptions) -> Vec<WorkflowCheckpoint> {
        let inner = self.inner.read().await;
        let mut items: Vec<WorkflowCheckpoint> = inner
            .checkpoints
            .values()
            .filter(|c| options.session_id.as_deref().is_none_or(|s| c.session_id == s))
            .filter(|c| options.status.is_none_or(|s| c.status == s))
            .filter(|c| options.tag.as_deref().is_none_or(|t| c.tags.iter().any(|x| x == t)))
            .filter(|c| options.state.is_none_or(|s| c.workflow_state_snapshot.state == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let items: Vec<_> = items.into_iter().skip(options.offset).collect();
        match options.limit {
            Some(limit) => items.into_iter().take(limit).collect(),
            None => items,
        }
    }

    pub async fn restore(
        &self,
        id: &str,
        options: RestoreOptions,
    ) -> Result<RollbackEvent> {
        let mut checkpoint = {
            let inner = self.inner.read().await;
            inner
                .checkpoints
                .get(id)
                .cloned()
                .ok_or_else(|| CoreError::CheckpointNotFound(id.to_string()))?
        };

        let mut context = WorkflowContext::default();
        let mut warnings = Vec::new();
        if options.context {
            context = checkpoint.context_snapshot.clone();
        } else {
            warnings.push("context not restored per options".to_string());
        }
        if !options.artifacts {
            context.artifact_ids.clear();
            warnings.push("artifacts not restored per options".to_string());
        }
        if !options.agents {
            context.agent_ids.clear();
            warnings.push("agents not restored per options".to_string());
        }
        if !options.history {
            warnings.push("history not restored per options".to_string());
        }

        checkpoint.status = CheckpointStatus::Restored;
        {
            let mut inner = self.inner.write().await;
            inner.checkpoints.insert(checkpoint.id.clone(), checkpoint.clone());
        }
        self.persist_one(&checkpoint).await;

        Ok(RollbackEvent {
            checkpoint_id: checkpoint.id,
            restored_state: checkpoint.workflow_state_snapshot.state,
            restored_context: context,
            artifact_refs: checkpoint.artifact_refs,
            agent_refs: checkpoint.agent_refs,
            warnings,
        })
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.checkpoints.remove(id)
        };
        let Some(mut checkpoint) = removed else {
            return Err(CoreError::CheckpointNotFound(id.to_string()));
        };
        {
            let mut inner = self.inner.write().await;
            if let Some(ids) = inner.by_session.get_mut(&checkpoint.session_id) {
                ids.retain(|existing| existing != id);
            }
        }
        checkpoint.status = CheckpointStatus::Deleted;
        if let Err(err) = self.storage.remove_item(&Self::storage_key(id)).await {
            warn!(%err, checkpoint_id = %id, "failed to remove checkpoint from storage");
        }
        Ok(())
    }

    pub async fn cleanup(&self, options: CleanupOptions) -> Vec<String> {
        let candidates: Vec<WorkflowCheckpoint> = {
            let inner = self.inner.read().await;
            inner
                .checkpoints
                .values()
                .filter(|c| options.older_than.is_none_or(|cutoff| c.created_at < cutoff))
                .filter(|c| options.statuses.is_empty() || options.statuses.contains(&c.status))
                .cloned()
                .collect()
        };
        let removed_ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        if !options.dry_run {
            for id in &removed_ids {
                let _ = self.delete(id).await;
            }
        }
        removed_ids
    }

    pub async fn get_stats(&self) -> CheckpointStats {
        let inner = self.inner.read().await;
        let mut stats = CheckpointStats { total: inner.checkpoints.len(), ..Default::default() };
        for checkpoint in inner.checkpoints.values() {
            if checkpoint.status == CheckpointStatus::Active {
                stats.active += 1;
            }
            *stats.per_session.entry(checkpoint.session_id.clone()).or_insert(0) += 1;
        }
        stats
    }

    fn storage_key(id: &str) -> String {
        format!("checkpoint:{id}")
    }

    async fn persist_one(&self, checkpoint: &WorkflowCheckpoint) {
        match serde_json::to_string(checkpoint) {
            Ok(raw) => {
                if let Err(err) = self.storage.set_item(&Self::storage_key(&checkpoint.id), raw).await {
                    warn!(%err, checkpoint_id = %checkpoint.id, "failed to persist checkpoint");
                }
            }
            Err(err) => warn!(%err, "failed to serialize checkpoint"),
        }
    }
}

/// Bridges the checkpoint service to a `WorkflowStateMachine`: auto-snapshots
/// on `stateChange` and exposes `rollbackTo*` helpers that re-emit a
/// [`RollbackEvent`] for the caller to re-apply.
pub struct CheckpointBridge {
    session_id: String,
    service: Arc<CheckpointService>,
    auto_checkpoint_states: Vec<WorkflowState>,
    rollback_events: broadcast::Sender<RollbackEvent>,
}

impl CheckpointBridge {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        service: Arc<CheckpointService>,
        auto_checkpoint_states: Vec<WorkflowState>,
    ) -> Self {
        let (rollback_events, _) = broadcast::channel(16);
        Self { session_id: session_id.into(), service, auto_checkpoint_states, rollback_events }
    }

    pub fn subscribe_rollback(&self) -> broadcast::Receiver<RollbackEvent> {
        self.rollback_events.subscribe()
    }

    /// Call with every `WorkflowEvent` observed from the WSM's broadcast
    /// channel; creates an auto-checkpoint when applicable.
    pub async fn on_workflow_event(&self, event: &WorkflowEvent) {
        let WorkflowEvent::StateChange { new_state, context, previous_state, timestamp, .. } =
            event
        else {
            return;
        };
        if !self.auto_checkpoint_states.contains(new_state) {
            return;
        }
        let name = format!("Auto-checkpoint: {new_state:?}");
        let history_entry = StateHistoryEntry {
            state: *new_state,
            timestamp: *timestamp,
            trigger: None,
            metadata: None,
        };
        let _ = self
            .service
            .create_checkpoint_from_workflow(
                self.session_id.clone(),
                *new_state,
                Some(*previous_state),
                vec![history_entry],
                context.clone(),
                Some(name),
                vec!["auto".to_string()],
                None,
            )
            .await;
    }

    pub async fn rollback_to_latest(&self) -> Result<RollbackEvent> {
        let checkpoint = self
            .service
            .get_latest(&self.session_id)
            .await
            .ok_or_else(|| CoreError::CheckpointNotFound("latest".to_string()))?;
        self.rollback_to_checkpoint(&checkpoint.id).await
    }

    pub async fn rollback_to_state(&self, state: WorkflowState) -> Result<RollbackEvent> {
        let checkpoint = self
            .service
            .get_checkpoints_for_state(&self.session_id, state)
            .await
            .into_iter()
            .max_by_key(|c| c.created_at)
            .ok_or_else(|| CoreError::CheckpointNotFound(format!("{state:?}")))?;
        self.rollback_to_checkpoint(&checkpoint.id).await
    }

    pub async fn rollback_to_checkpoint(&self, id: &str) -> Result<RollbackEvent> {
        let event = self.service.restore(id, RestoreOptions::default()).await?;
        let _ = self.rollback_events.send(event.clone());
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageAdapter;

    fn service() -> Arc<CheckpointService> {
        Arc::new(CheckpointService::new(Arc::new(InMemoryStorageAdapter::new()), 10))
    }

    #[tokio::test]
    async fn checkpoint_round_trip_restores_state_and_context() {
        let service = service();
        let mut context = WorkflowContext::default();
        context.user_task = "Implement auth".to_string();
        let checkpoint = service
            .create_checkpoint_from_workflow(
                "sess-1",
                WorkflowState::Planning,
                None,
                vec![],
                context.clone(),
                None,
                vec![],
                None,
            )
            .await
            .unwrap();

        let restored = service.restore(&checkpoint.id, RestoreOptions::default()).await.unwrap();
        assert_eq!(restored.restored_state, WorkflowState::Planning);
        assert_eq!(restored.restored_context.user_task, "Implement auth");

        let latest = service.get_latest("sess-1").await.unwrap();
        assert_eq!(latest.id, checkpoint.id);
    }

    #[tokio::test]
    async fn session_cap_evicts_oldest_checkpoint() {
        let service = Arc::new(CheckpointService::new(Arc::new(InMemoryStorageAdapter::new()), 2));
        for i in 0..3 {
            service
                .create_checkpoint_from_workflow(
                    "sess-1",
                    WorkflowState::Planning,
                    None,
                    vec![],
                    WorkflowContext { current_step: i, ..Default::default() },
                    None,
                    vec![],
                    None,
                )
                .await
                .unwrap();
        }
        let stats = service.get_stats().await;
        assert_eq!(*stats.per_session.get("sess-1").unwrap(), 2);
    }

    #[tokio::test]
    async fn bridge_auto_checkpoints_on_configured_states() {
        let service = service();
        let bridge = CheckpointBridge::new("sess-1", Arc::clone(&service), vec![WorkflowState::PlanReview]);
        let event = WorkflowEvent::StateChange {
            previous_state: WorkflowState::Planning,
            new_state: WorkflowState::PlanReview,
            trigger: Some("plan_created".to_string()),
            timestamp: Utc::now(),
            context: WorkflowContext::default(),
        };
        bridge.on_workflow_event(&event).await;
        let latest = service.get_latest("sess-1").await;
        assert!(latest.is_some());
    }

    #[tokio::test]
    async fn rollback_emits_event_with_restored_state() {
        let service = service();
        let bridge = CheckpointBridge::new("sess-1", Arc::clone(&service), vec![]);
        let mut rx = bridge.subscribe_rollback();
        service
            .create_checkpoint_from_workflow(
                "sess-1",
                WorkflowState::Planning,
                None,
                vec![],
                WorkflowContext::default(),
                None,
                vec![],
                None,
            )
            .await
            .unwrap();
        bridge.rollback_to_latest().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.restored_state, WorkflowState::Planning);
    }
}
