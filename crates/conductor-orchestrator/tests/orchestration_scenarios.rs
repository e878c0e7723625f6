//! End-to-end scenario coverage for the `Orchestrator` façade, driven only
//! through its public API — no internal module paths.
//!
//! Covers the happy path to completion, the plan-revision and test-failure
//! loops, admission control under concurrency limits, request-timeout
//! delivery failures flowing through error recovery, and checkpoint rollback
//! restoring workflow state after an unrecoverable task error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use conductor_core::storage::InMemoryStorageAdapter;
use conductor_core::WorkflowState;
use conductor_orchestrator::{
    CircuitBreakerConfig, ErrorContext, ErrorType, FileLockService, LockHandleInfo, LockMode,
    Orchestrator, OrchestratorDeps, PoolConfig, ProcessRuntime, ProviderSettingsResolver,
    RecoveryEvent, RoleRegistry, RouterError, RuntimeControlMessage, RuntimeEvent, RuntimeEventKind,
    Severity,
};

#[derive(Default)]
struct StubRuntime {
    events: Mutex<Option<broadcast::Sender<RuntimeEvent>>>,
    counter: AtomicU64,
}

impl StubRuntime {
    fn new() -> Self {
        Self::default()
    }

    async fn emit(&self, event: RuntimeEvent) {
        let mut guard = self.events.lock().await;
        let sender = guard.get_or_insert_with(|| broadcast::channel(256).0);
        let _ = sender.send(event);
    }
}

#[async_trait]
impl ProcessRuntime for StubRuntime {
    async fn spawn_process(
        &self,
        agent_id: &str,
        _config: &conductor_orchestrator::AgentSpawnConfig,
    ) -> Result<String, String> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("session-{agent_id}-{n}");
        self.emit(RuntimeEvent {
            agent_id: agent_id.to_string(),
            session_id: session_id.clone(),
            kind: RuntimeEventKind::SessionCreated,
            message: None,
        })
        .await;
        Ok(session_id)
    }

    async fn send_message(&self, _session_id: &str, _message: RuntimeControlMessage) -> Result<(), String> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        futures::executor::block_on(async {
            let mut guard = self.events.lock().await;
            guard.get_or_insert_with(|| broadcast::channel(256).0).subscribe()
        })
    }
}

#[derive(Default)]
struct StubLockService {
    locks: Mutex<HashMap<String, LockHandleInfo>>,
    counter: AtomicU64,
}

#[async_trait]
impl FileLockService for StubLockService {
    async fn acquire_lock(
        &self,
        file_path: &str,
        agent_id: &str,
        mode: LockMode,
        _timeout_ms: Option<u64>,
    ) -> Result<String, String> {
        let id = format!("lock-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        self.locks.lock().await.insert(
            id.clone(),
            LockHandleInfo {
                lock_id: id.clone(),
                file_path: file_path.to_string(),
                agent_id: agent_id.to_string(),
                mode,
            },
        );
        Ok(id)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<(), String> {
        self.locks.lock().await.remove(lock_id);
        Ok(())
    }

    async fn release_all_locks_for_agent(&self, agent_id: &str) -> Result<usize, String> {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, info| info.agent_id != agent_id);
        Ok(before - locks.len())
    }

    async fn get_locks_for_agent(&self, agent_id: &str) -> Vec<LockHandleInfo> {
        self.locks.lock().await.values().filter(|info| info.agent_id == agent_id).cloned().collect()
    }

    async fn agent_has_locks(&self, agent_id: &str) -> bool {
        self.locks.lock().await.values().any(|info| info.agent_id == agent_id)
    }
}

struct StaticRoleRegistry;

impl RoleRegistry for StaticRoleRegistry {
    fn get_provider_profile_for_role(&self, _role: &str) -> Option<String> {
        Some("default".to_string())
    }

    fn get_mode_for_role(&self, _role: &str) -> Option<String> {
        Some("code".to_string())
    }
}

struct StaticProviderResolver;

impl ProviderSettingsResolver for StaticProviderResolver {
    fn get_provider_settings_for_role(&self, _role: &str) -> Option<serde_json::Value> {
        Some(serde_json::json!({"model": "default"}))
    }
}

fn build(session_id: &str, max_concurrent_agents: usize) -> (Arc<Orchestrator>, Arc<StubRuntime>) {
    let runtime = Arc::new(StubRuntime::new());
    let deps = OrchestratorDeps {
        runtime: runtime.clone(),
        lock_service: Arc::new(StubLockService::default()),
        storage: Arc::new(InMemoryStorageAdapter::new()),
        role_registry: Arc::new(StaticRoleRegistry),
        provider_resolver: Arc::new(StaticProviderResolver),
        pool_config: PoolConfig { max_concurrent_agents, ..Default::default() },
        breaker_config: CircuitBreakerConfig::default(),
        max_checkpoints_per_session: 10,
    };
    (Orchestrator::new(session_id, deps), runtime)
}

async fn spawn_and_settle(orchestrator: &Orchestrator, runtime: &StubRuntime, agent_id: &str, role: &str) {
    let mut rx = runtime.subscribe();
    orchestrator.spawn_agent_for_role(agent_id, role, "/workspace", None).await.unwrap();
    let event = rx.recv().await.unwrap();
    orchestrator.pool().apply_runtime_event(event).await;
}

/// S1 — a task driven through every artifact/review/test milestone in order
/// reaches `COMPLETED` with full progress, never touching the Pool/Router/ERM.
#[tokio::test]
async fn happy_path_walks_every_milestone_to_completion() {
    let (orchestrator, _runtime) = build("scenario-s1", 4);
    orchestrator.start_task("Implement auth").await.unwrap();

    assert_eq!(orchestrator.report_artifact("implementation_plan").await.unwrap(), WorkflowState::PlanReview);
    assert_eq!(orchestrator.report_plan_review(true).await.unwrap(), WorkflowState::StructureCreation);
    assert_eq!(orchestrator.report_artifact("pseudocode").await.unwrap(), WorkflowState::CodeImplementation);
    assert_eq!(orchestrator.report_artifact("code").await.unwrap(), WorkflowState::CodeReview);
    assert_eq!(orchestrator.report_code_review(true).await.unwrap(), WorkflowState::Documentation);
    assert_eq!(orchestrator.report_artifact("documentation").await.unwrap(), WorkflowState::Testing);
    assert_eq!(orchestrator.report_test_results(true).await.unwrap(), WorkflowState::Completed);

    assert_eq!(orchestrator.wsm().get_progress().await, 100);
    orchestrator.dispose().await;
}

/// S2 — a rejected plan routes through `PLAN_REVISION` and back before the
/// workflow is allowed to advance past plan review.
#[tokio::test]
async fn plan_revision_then_approval_returns_to_the_review_gate() {
    let (orchestrator, _runtime) = build("scenario-s2", 4);
    orchestrator.start_task("Implement billing export").await.unwrap();
    orchestrator.report_artifact("implementation_plan").await.unwrap();

    assert_eq!(orchestrator.report_plan_review(false).await.unwrap(), WorkflowState::PlanRevision);
    assert_eq!(
        orchestrator.wsm().transition(WorkflowState::PlanReview, Some("plan_revised"), None).await.unwrap(),
        WorkflowState::PlanReview
    );
    assert_eq!(orchestrator.report_plan_review(true).await.unwrap(), WorkflowState::StructureCreation);

    orchestrator.dispose().await;
}

/// S3 — a failed test run loops back through `CODE_FIXING` and a second
/// review pass before completion.
#[tokio::test]
async fn failed_tests_loop_back_through_code_fixing_before_completion() {
    let (orchestrator, _runtime) = build("scenario-s3", 4);
    orchestrator.start_task("Fix the export job").await.unwrap();
    orchestrator.report_artifact("implementation_plan").await.unwrap();
    orchestrator.report_plan_review(true).await.unwrap();
    orchestrator.report_artifact("pseudocode").await.unwrap();
    orchestrator.report_artifact("code").await.unwrap();
    orchestrator.report_code_review(true).await.unwrap();
    orchestrator.report_artifact("documentation").await.unwrap();
    assert_eq!(orchestrator.wsm().get_state().await, WorkflowState::Testing);

    assert_eq!(orchestrator.report_test_results(false).await.unwrap(), WorkflowState::CodeFixing);
    assert_eq!(orchestrator.report_artifact("code").await.unwrap(), WorkflowState::CodeReview);
    assert_eq!(orchestrator.report_code_review(true).await.unwrap(), WorkflowState::Documentation);
    assert_eq!(orchestrator.report_artifact("documentation").await.unwrap(), WorkflowState::Testing);
    assert_eq!(orchestrator.report_test_results(true).await.unwrap(), WorkflowState::Completed);

    orchestrator.dispose().await;
}

/// S4 — admission control rejects a third concurrent agent once the pool's
/// configured cap is reached, leaving the active roster untouched.
#[tokio::test]
async fn admission_control_rejects_agents_past_the_concurrency_cap() {
    let (orchestrator, runtime) = build("scenario-s4", 2);
    orchestrator.start_task("Build the payments module").await.unwrap();

    spawn_and_settle(&orchestrator, &runtime, "coder-1", "primary-coder").await;
    spawn_and_settle(&orchestrator, &runtime, "reviewer-1", "code-reviewer").await;
    assert_eq!(orchestrator.pool().get_active_agent_count().await, 2);

    let rejected = orchestrator.spawn_agent_for_role("coder-2", "primary-coder", "/workspace", None).await;
    assert_eq!(rejected.unwrap_err(), "Maximum concurrent agents");
    assert_eq!(orchestrator.pool().get_active_agent_count().await, 2);

    orchestrator.dispose().await;
}

/// S5 — a request to a paused (non-deliverable) agent times out at the
/// router and is funneled through error recovery as a delivery failure.
#[tokio::test]
async fn timed_out_request_to_a_paused_agent_triggers_recovery() {
    let (orchestrator, runtime) = build("scenario-s5", 4);
    orchestrator.start_task("Investigate the flaky test").await.unwrap();
    spawn_and_settle(&orchestrator, &runtime, "coder-1", "primary-coder").await;
    orchestrator.pool().pause("coder-1").await.unwrap();

    let mut recovery_events = orchestrator.erm().subscribe();
    let err = orchestrator.dispatch_request("coder-1", serde_json::json!({"run": "tests"}), 50).await.unwrap_err();
    assert_eq!(err, RouterError::Timeout(50));

    let recovered = recovery_events.recv().await.unwrap();
    assert!(matches!(recovered, RecoveryEvent::RecoverySuccess { .. } | RecoveryEvent::RecoveryFailed { .. }));

    orchestrator.dispose().await;
}

/// S6 — an unrecoverable task error rolls the workflow back to the last
/// checkpoint, restoring both the WSM state and the observable rollback event.
#[tokio::test]
async fn unrecoverable_task_error_rolls_the_workflow_back_to_its_checkpoint() {
    let (orchestrator, _runtime) = build("scenario-s6", 4);
    orchestrator.start_task("Ship the release notes").await.unwrap();
    let checkpoint_id =
        orchestrator.checkpoint_now(Some("pre-review snapshot".to_string()), vec!["milestone".to_string()]).await.unwrap();

    orchestrator.report_artifact("implementation_plan").await.unwrap();
    assert_eq!(orchestrator.wsm().get_state().await, WorkflowState::PlanReview);

    let mut rollbacks = orchestrator.subscribe_rollback();
    let result = orchestrator
        .report_error(ErrorContext {
            error_id: "scenario-s6-error".to_string(),
            error_type: ErrorType::TaskExecutionError,
            severity: Some(Severity::Critical),
            agent_id: None,
            session_id: Some("scenario-s6".to_string()),
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

    let rollback = rollbacks.recv().await.unwrap();
    assert_eq!(rollback.checkpoint_id, checkpoint_id);

    orchestrator.dispose().await;
}
