//! Orchestrator façade: the single composition root a caller drives. Owns
//! one Workflow State Machine, one Agent Pool Manager, one Message Router,
//! one Error Recovery Manager, one checkpoint service/bridge, and one
//! Context Monitor, wiring them exactly per the project's dependency order
//! (Pool → Router via `AgentLookup`; Pool/Router/Checkpoint → ERM).
//!
//! Grounded on `radium_orchestrator::Orchestrator`: a single struct owning
//! `registry`/`lifecycle`/`queue`/`executor`/`processor`/`selector` behind
//! `Arc`, each wired at construction and exposing one façade method per
//! concern rather than leaking the subsystems to the caller.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use conductor_core::checkpoint::{CheckpointBridge, CheckpointService, RollbackEvent};
use conductor_core::storage::StorageAdapter;
use conductor_core::{CoreError, WorkflowContext, WorkflowState, WorkflowStateMachine};

use crate::erm::{CircuitBreakerConfig, ErmError, ErrorContext, ErrorRecoveryManager, RecoveryResult};
use crate::interfaces::{
    AgentLookup, FileLockService, ProcessRuntime, ProviderSettingsResolver, RoleRegistry,
};
use crate::pool::{AgentInstance, AgentPoolManager, AgentSpawnConfig, PoolConfig};
use crate::router::{AgentMessage, MessageRouter, RouterError};

/// States on which the orchestrator auto-checkpoints the workflow. Mirrors
/// the phases after which losing progress would be expensive to redo.
fn default_auto_checkpoint_states() -> Vec<WorkflowState> {
    vec![
        WorkflowState::PlanReview,
        WorkflowState::StructureCreation,
        WorkflowState::CodeReview,
        WorkflowState::Documentation,
        WorkflowState::Completed,
    ]
}

/// Construction parameters the caller supplies for out-of-scope
/// collaborators and tunables. Grouped into one struct since the
/// façade's constructor would otherwise take a dozen positional arguments.
pub struct OrchestratorDeps {
    pub runtime: Arc<dyn ProcessRuntime>,
    pub lock_service: Arc<dyn FileLockService>,
    pub storage: Arc<dyn StorageAdapter>,
    pub role_registry: Arc<dyn RoleRegistry>,
    pub provider_resolver: Arc<dyn ProviderSettingsResolver>,
    pub pool_config: PoolConfig,
    pub breaker_config: CircuitBreakerConfig,
    pub max_checkpoints_per_session: usize,
}

/// Single long-lived supervisor for one user task. A user task enters at
/// [`Orchestrator::start_task`], advances the WSM, and at each state
/// transition the caller spawns the role-specific agent via [`Self::spawn_agent_for_role`]
/// and dispatches a typed request via [`Self::dispatch_request`]. Replies
/// feed back into the WSM via [`Self::report_artifact`]; failures flow
/// through [`Self::report_error`].
pub struct Orchestrator {
    session_id: String,
    wsm: Arc<WorkflowStateMachine>,
    pool: Arc<AgentPoolManager>,
    router: Arc<MessageRouter>,
    erm: Arc<ErrorRecoveryManager>,
    checkpoint_service: Arc<CheckpointService>,
    checkpoint_bridge: Arc<CheckpointBridge>,
    role_registry: Arc<dyn RoleRegistry>,
    provider_resolver: Arc<dyn ProviderSettingsResolver>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").field("session_id", &self.session_id).finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds and wires every subsystem, then starts the Pool's health
    /// monitor and the Router's queue processor. Also spawns two bridging
    /// tasks: runtime events → `pool.apply_runtime_event`, and WSM state
    /// changes → `checkpoint_bridge.on_workflow_event`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, deps: OrchestratorDeps) -> Arc<Self> {
        let session_id = session_id.into();

        let wsm = Arc::new(WorkflowStateMachine::new(session_id.clone()));
        let pool = Arc::new(AgentPoolManager::new(deps.runtime.clone(), deps.lock_service.clone(), deps.pool_config));
        let agent_lookup: Arc<dyn AgentLookup> = pool.clone();
        let router = Arc::new(MessageRouter::new(agent_lookup));
        let checkpoint_service =
            Arc::new(CheckpointService::new(deps.storage.clone(), deps.max_checkpoints_per_session));
        let checkpoint_bridge = Arc::new(CheckpointBridge::new(
            session_id.clone(),
            checkpoint_service.clone(),
            default_auto_checkpoint_states(),
        ));
        let erm = Arc::new(ErrorRecoveryManager::new(
            pool.clone(),
            router.clone(),
            checkpoint_service.clone(),
            deps.breaker_config,
        ));

        pool.start_health_monitor();
        router.start_queue_processor();

        let runtime_events = deps.runtime.subscribe();
        let pool_for_events = pool.clone();
        tokio::spawn(forward_runtime_events(runtime_events, pool_for_events));

        let mut wsm_events = wsm.subscribe();
        let bridge_for_events = checkpoint_bridge.clone();
        tokio::spawn(async move {
            while let Ok(event) = wsm_events.recv().await {
                bridge_for_events.on_workflow_event(&event).await;
            }
        });

        Arc::new(Self {
            session_id,
            wsm,
            pool,
            router,
            erm,
            checkpoint_service,
            checkpoint_bridge,
            role_registry: deps.role_registry,
            provider_resolver: deps.provider_resolver,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn wsm(&self) -> &Arc<WorkflowStateMachine> {
        &self.wsm
    }

    pub fn pool(&self) -> &Arc<AgentPoolManager> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn erm(&self) -> &Arc<ErrorRecoveryManager> {
        &self.erm
    }

    pub fn checkpoint_service(&self) -> &Arc<CheckpointService> {
        &self.checkpoint_service
    }

    /// `IDLE` → `PLANNING`. The entry point for a new user task.
    pub async fn start_task(&self, user_task: impl Into<String>) -> Result<WorkflowState, CoreError> {
        self.wsm.start_task(user_task).await
    }

    /// Resolves `role` against the role/provider catalogues, spawns the
    /// agent via the Pool, and records it against the current workflow
    /// context.
    pub async fn spawn_agent_for_role(
        &self,
        agent_id: impl Into<String>,
        role: &str,
        workspace: impl Into<String>,
        task: Option<String>,
    ) -> Result<String, String> {
        let mode = self.role_registry.get_mode_for_role(role).ok_or_else(|| format!("unknown role: {role}"))?;
        let provider_profile = self
            .role_registry
            .get_provider_profile_for_role(role)
            .ok_or_else(|| format!("no provider profile configured for role: {role}"))?;
        // Resolving provider settings confirms the profile is actually
        // configured before a process is spawned against it.
        if self.provider_resolver.get_provider_settings_for_role(role).is_none() {
            warn!(%role, "no provider settings resolved; proceeding with profile default");
        }

        let config = AgentSpawnConfig {
            agent_id: agent_id.into(),
            role: role.to_string(),
            mode,
            provider_profile,
            workspace: workspace.into(),
            task,
            session_id: None,
            custom_modes: None,
            auto_approve: None,
        };
        let agent_id = self.pool.spawn(config).await?;
        self.wsm.record_agent(agent_id.clone()).await;
        Ok(agent_id)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentInstance> {
        self.pool.get_agent(agent_id).await
    }

    /// Dispatches a typed request to `agent_id` and awaits its response,
    /// funneling delivery/timeout failures through the ERM as
    /// `message_delivery_error`.
    pub async fn dispatch_request(
        &self,
        agent_id: &str,
        payload: Value,
        timeout_ms: u64,
    ) -> Result<AgentMessage, RouterError> {
        match self.router.send_request(agent_id, payload, timeout_ms).await {
            Ok(response) => Ok(response),
            Err(err) => {
                let workflow_state = format!("{:?}", self.wsm.get_state().await);
                let _ = self
                    .erm
                    .handle_error(ErrorContext {
                        error_id: format!("dispatch_{}", uuid::Uuid::new_v4()),
                        error_type: crate::erm::ErrorType::MessageDeliveryError,
                        severity: None,
                        agent_id: Some(agent_id.to_string()),
                        session_id: Some(self.session_id.clone()),
                        workflow_state: Some(workflow_state),
                        message_context: None,
                        retry_count: 0,
                        metadata: serde_json::Map::new(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// Feeds a produced artifact back into the WSM, advancing to the
    /// canonical next state for its type.
    pub async fn report_artifact(&self, artifact_type: &str) -> Result<WorkflowState, CoreError> {
        self.wsm.handle_artifact_created(artifact_type).await
    }

    pub async fn report_plan_review(&self, approved: bool) -> Result<WorkflowState, CoreError> {
        self.wsm.handle_plan_review(approved).await
    }

    pub async fn report_code_review(&self, approved: bool) -> Result<WorkflowState, CoreError> {
        self.wsm.handle_code_review(approved).await
    }

    pub async fn report_test_results(&self, passed: bool) -> Result<WorkflowState, CoreError> {
        self.wsm.handle_test_results(passed).await
    }

    /// Routes a failure through the ERM. On a successful `rollback`
    /// strategy, re-applies the restored state/context to the WSM — the
    /// bridge only ever emits the event, the orchestrator is the one
    /// collaborator allowed to reach into the WSM on its behalf.
    pub async fn report_error(&self, ctx: ErrorContext) -> Result<RecoveryResult, ErmError> {
        let result = self.erm.handle_error(ctx).await?;
        if result.success {
            if let Some(checkpoint_id) = &result.restored_checkpoint_id {
                self.apply_rollback(checkpoint_id).await;
            }
        }
        Ok(result)
    }

    async fn apply_rollback(&self, checkpoint_id: &str) {
        match self.checkpoint_bridge.rollback_to_checkpoint(checkpoint_id).await {
            Ok(RollbackEvent { restored_state, restored_context, .. }) => {
                self.wsm.restore_snapshot(restored_state, restored_context).await;
                info!(%checkpoint_id, ?restored_state, "workflow rolled back to checkpoint");
            }
            Err(err) => warn!(%checkpoint_id, %err, "rollback restore failed"),
        }
    }

    /// Creates a named checkpoint of the current WSM state on demand, in
    /// addition to the bridge's automatic ones.
    pub async fn checkpoint_now(&self, name: Option<String>, tags: Vec<String>) -> Result<String, CoreError> {
        let state = self.wsm.get_state().await;
        let previous_state = self.wsm.get_previous_state().await;
        let history = self.wsm.get_history(None).await;
        let context = self.wsm.get_context().await;
        let checkpoint = self
            .checkpoint_service
            .create_checkpoint_from_workflow(
                self.session_id.clone(),
                state,
                previous_state,
                history,
                context,
                name,
                tags,
                None,
            )
            .await?;
        Ok(checkpoint.id)
    }

    pub fn subscribe_rollback(&self) -> tokio::sync::broadcast::Receiver<RollbackEvent> {
        self.checkpoint_bridge.subscribe_rollback()
    }

    /// Shuts down every subsystem's background task and releases held
    /// resources. Idempotent; safe to call once at end of session.
    pub async fn dispose(&self) {
        self.erm.dispose();
        self.router.dispose().await;
        self.pool.dispose().await;
    }
}

async fn forward_runtime_events(
    mut events: tokio::sync::broadcast::Receiver<crate::interfaces::RuntimeEvent>,
    pool: Arc<AgentPoolManager>,
) {
    loop {
        match events.recv().await {
            Ok(event) => pool.apply_runtime_event(event).await,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "runtime event forwarder lagged, events dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erm::ErrorType;
    use crate::interfaces::test_doubles::{MockFileLockService, MockProcessRuntime, StaticRoleRegistry};
    use conductor_core::storage::InMemoryStorageAdapter;

    struct StaticProviderResolver;
    impl ProviderSettingsResolver for StaticProviderResolver {
        fn get_provider_settings_for_role(&self, _role: &str) -> Option<Value> {
            Some(serde_json::json!({"model": "default"}))
        }
    }

    fn deps() -> (OrchestratorDeps, Arc<MockProcessRuntime>) {
        let runtime = Arc::new(MockProcessRuntime::new());
        let deps = OrchestratorDeps {
            runtime: runtime.clone(),
            lock_service: Arc::new(MockFileLockService::new()),
            storage: Arc::new(InMemoryStorageAdapter::new()),
            role_registry: Arc::new(StaticRoleRegistry),
            provider_resolver: Arc::new(StaticProviderResolver),
            pool_config: PoolConfig { max_concurrent_agents: 1, ..Default::default() },
            breaker_config: CircuitBreakerConfig::default(),
            max_checkpoints_per_session: 10,
        };
        (deps, runtime)
    }

    #[tokio::test]
    async fn start_task_then_spawn_advances_wsm_and_records_agent() {
        let (deps, runtime) = deps();
        let orchestrator = Orchestrator::new("sess-s4", deps);
        orchestrator.start_task("Implement auth").await.unwrap();

        let mut rx = runtime.subscribe();
        orchestrator.spawn_agent_for_role("a1", "primary-coder", "/workspace", None).await.unwrap();
        let event = rx.recv().await.unwrap();
        orchestrator.pool().apply_runtime_event(event).await;

        assert_eq!(orchestrator.pool().get_active_agent_count().await, 1);
        assert!(orchestrator.wsm().get_context().await.agent_ids.contains(&"a1".to_string()));
    }

    #[tokio::test]
    async fn admission_control_blocks_second_agent_at_orchestrator_level() {
        let (deps, runtime) = deps();
        let orchestrator = Orchestrator::new("sess-s4b", deps);
        orchestrator.start_task("task").await.unwrap();

        let mut rx = runtime.subscribe();
        orchestrator.spawn_agent_for_role("a1", "primary-coder", "/workspace", None).await.unwrap();
        let event = rx.recv().await.unwrap();
        orchestrator.pool().apply_runtime_event(event).await;

        let err = orchestrator.spawn_agent_for_role("a2", "primary-coder", "/workspace", None).await.unwrap_err();
        assert_eq!(err, "Maximum concurrent agents");
        assert_eq!(orchestrator.pool().get_active_agent_count().await, 1);
    }

    #[tokio::test]
    async fn dispatch_request_times_out_and_reports_a_delivery_error() {
        let (deps, runtime) = deps();
        let orchestrator = Orchestrator::new("sess-s5", deps);
        orchestrator.start_task("task").await.unwrap();

        let mut rx = runtime.subscribe();
        orchestrator.spawn_agent_for_role("agentX", "primary-coder", "/workspace", None).await.unwrap();
        let event = rx.recv().await.unwrap();
        orchestrator.pool().apply_runtime_event(event).await;
        orchestrator.pool().pause("agentX").await.unwrap();

        let mut recovery_events = orchestrator.erm().subscribe();
        let err = orchestrator
            .dispatch_request("agentX", serde_json::json!({"hello": "world"}), 50)
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::Timeout(50));

        let recovered = recovery_events.recv().await.unwrap();
        assert!(matches!(
            recovered,
            crate::erm::RecoveryEvent::RecoverySuccess { .. } | crate::erm::RecoveryEvent::RecoveryFailed { .. }
        ));
    }

    #[tokio::test]
    async fn recovery_rollback_restores_the_checkpointed_workflow_state() {
        let (deps, _runtime) = deps();
        let orchestrator = Orchestrator::new("sess-s6", deps);
        orchestrator.start_task("task").await.unwrap();
        let checkpoint_id = orchestrator.checkpoint_now(Some("before review".to_string()), vec![]).await.unwrap();
        orchestrator.report_artifact("implementation_plan").await.unwrap();
        assert_eq!(orchestrator.wsm().get_state().await, WorkflowState::PlanReview);

        let result = orchestrator
            .report_error(ErrorContext {
                error_id: "e1".to_string(),
                error_type: ErrorType::TaskExecutionError,
                severity: Some(crate::erm::Severity::Critical),
                agent_id: None,
                session_id: Some("sess-s6".to_string()),
                workflow_state: None,
                message_context: None,
                retry_count: 10,
                metadata: serde_json::Map::new(),
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.restored_checkpoint_id.as_deref(), Some(checkpoint_id.as_str()));
        assert_eq!(orchestrator.wsm().get_state().await, WorkflowState::Planning);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_stops_background_tasks() {
        let (deps, _runtime) = deps();
        let orchestrator = Orchestrator::new("sess-dispose", deps);
        orchestrator.dispose().await;
        orchestrator.dispose().await;
    }
}
