//! External collaborator contracts the orchestrator consumes but never
//! implements: the per-agent subprocess runtime, the file-lock service, the
//! artifact store, the role/provider catalogues, and the narrow seam that
//! breaks the Router↔Pool reference cycle.
//!
//! Grounded on the teacher's narrow-interface-over-concrete-type pattern
//! (`radium_orchestrator::Agent`) and on
//! `radium_core::collaboration::lock_manager::ResourceLockManager`'s
//! lock/release/timeout contract, modeled here as a trait rather than
//! reimplemented.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::pool::AgentSpawnConfig;

/// Runtime-observed lifecycle events for a spawned agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEventKind {
    SessionCreated,
    Complete,
    Error,
    Interrupted,
}

/// An event delivered by the [`ProcessRuntime`] collaborator.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub agent_id: String,
    pub session_id: String,
    pub kind: RuntimeEventKind,
    pub message: Option<String>,
}

/// Control messages sent to a live agent session.
#[derive(Debug, Clone)]
pub enum RuntimeControlMessage {
    Ping,
    Pause,
    Resume,
    Shutdown,
    AgentMessage(serde_json::Value),
}

/// Spawns and signals per-agent subprocesses; delivers their lifecycle
/// events on a broadcast channel rather than a per-call callback.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    async fn spawn_process(
        &self,
        agent_id: &str,
        config: &AgentSpawnConfig,
    ) -> Result<String, String>;

    async fn send_message(
        &self,
        session_id: &str,
        message: RuntimeControlMessage,
    ) -> Result<(), String>;

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;
}

/// File-lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// A held lock as reported by the [`FileLockService`].
#[derive(Debug, Clone)]
pub struct LockHandleInfo {
    pub lock_id: String,
    pub file_path: String,
    pub agent_id: String,
    pub mode: LockMode,
}

/// Externally owned file-locking contract the Pool releases locks through on
/// terminate/error/restart/interrupted.
#[async_trait]
pub trait FileLockService: Send + Sync {
    async fn acquire_lock(
        &self,
        file_path: &str,
        agent_id: &str,
        mode: LockMode,
        timeout_ms: Option<u64>,
    ) -> Result<String, String>;

    async fn release_lock(&self, lock_id: &str) -> Result<(), String>;

    async fn release_all_locks_for_agent(&self, agent_id: &str) -> Result<usize, String>;

    async fn get_locks_for_agent(&self, agent_id: &str) -> Vec<LockHandleInfo>;

    async fn agent_has_locks(&self, agent_id: &str) -> bool;
}

/// Minimal, summary-only artifact handle. The orchestrator never reads full
/// artifact content.
#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    pub id: String,
    pub artifact_type: String,
    pub summary: String,
    pub status: String,
    pub producer_role: String,
}

/// Content-addressed blob+summary store. Out of scope for this crate; only
/// the summary-reading surface is consumed.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn create_artifact(
        &self,
        artifact_type: &str,
        producer_id: &str,
        producer_role: &str,
        full_content: &str,
    ) -> Result<String, String>;

    async fn get_artifact_summary(&self, id: &str) -> Option<ArtifactSummary>;

    async fn update_artifact_status(&self, id: &str, status: &str) -> Result<(), String>;

    async fn get_all_summaries(&self) -> Vec<ArtifactSummary>;
}

/// Role/mode/provider-profile catalogue.
pub trait RoleRegistry: Send + Sync {
    fn get_provider_profile_for_role(&self, role: &str) -> Option<String>;
    fn get_mode_for_role(&self, role: &str) -> Option<String>;
}

/// Resolves provider settings for a role. Folds the source's
/// `OrchestrationConfigService` + `ProviderSettingsManager` pair into one
/// seam since the orchestrator only ever calls them together.
pub trait ProviderSettingsResolver: Send + Sync {
    fn get_provider_settings_for_role(&self, role: &str) -> Option<serde_json::Value>;
}

/// Narrow interface the Router uses to observe and message agents without
/// depending on the concrete `AgentPoolManager` type (breaks the Router↔Pool
/// cycle per the project's cyclic-reference convention).
#[async_trait]
pub trait AgentLookup: Send + Sync {
    /// True if the agent exists at all, in any status.
    async fn is_known(&self, agent_id: &str) -> bool;
    /// True if the agent's status is `ready` or `busy` — eligible for
    /// immediate IPC delivery rather than queueing.
    async fn is_deliverable(&self, agent_id: &str) -> bool;
    async fn active_agent_ids(&self) -> Vec<String>;
    async fn deliver(&self, agent_id: &str, payload: serde_json::Value) -> Result<(), String>;
}

#[cfg(test)]
pub mod test_doubles {
    use super::{
        AgentLookup, ArtifactStore, ArtifactSummary, FileLockService, LockHandleInfo, LockMode,
        ProcessRuntime, RuntimeControlMessage, RuntimeEvent, RuntimeEventKind,
    };
    use crate::pool::AgentSpawnConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::{broadcast, Mutex};

    #[derive(Default)]
    pub struct MockProcessRuntime {
        events: Mutex<Option<broadcast::Sender<RuntimeEvent>>>,
        counter: AtomicU64,
        pub fail_spawn: std::sync::atomic::AtomicBool,
    }

    impl MockProcessRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn emit(&self, event: RuntimeEvent) {
            let mut guard = self.events.lock().await;
            let sender = guard.get_or_insert_with(|| broadcast::channel(256).0);
            let _ = sender.send(event);
        }
    }

    #[async_trait]
    impl ProcessRuntime for MockProcessRuntime {
        async fn spawn_process(
            &self,
            agent_id: &str,
            _config: &AgentSpawnConfig,
        ) -> Result<String, String> {
            if self.fail_spawn.load(Ordering::Relaxed) {
                return Err("spawn failed".to_string());
            }
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

        async fn send_message(
            &self,
            _session_id: &str,
            _message: RuntimeControlMessage,
        ) -> Result<(), String> {
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
    pub struct MockFileLockService {
        locks: Mutex<HashMap<String, LockHandleInfo>>,
        counter: AtomicU64,
    }

    impl MockFileLockService {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FileLockService for MockFileLockService {
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
            self.locks
                .lock()
                .await
                .values()
                .filter(|info| info.agent_id == agent_id)
                .cloned()
                .collect()
        }

        async fn agent_has_locks(&self, agent_id: &str) -> bool {
            self.locks.lock().await.values().any(|info| info.agent_id == agent_id)
        }
    }

    #[derive(Default)]
    pub struct MockArtifactStore {
        summaries: Mutex<HashMap<String, ArtifactSummary>>,
        counter: AtomicU64,
    }

    #[async_trait]
    impl ArtifactStore for MockArtifactStore {
        async fn create_artifact(
            &self,
            artifact_type: &str,
            producer_id: &str,
            producer_role: &str,
            full_content: &str,
        ) -> Result<String, String> {
            let id = format!("artifact-{}", self.counter.fetch_add(1, Ordering::Relaxed));
            self.summaries.lock().await.insert(
                id.clone(),
                ArtifactSummary {
                    id: id.clone(),
                    artifact_type: artifact_type.to_string(),
                    summary: full_content.chars().take(120).collect(),
                    status: "created".to_string(),
                    producer_role: producer_role.to_string(),
                },
            );
            let _ = producer_id;
            Ok(id)
        }

        async fn get_artifact_summary(&self, id: &str) -> Option<ArtifactSummary> {
            self.summaries.lock().await.get(id).cloned()
        }

        async fn update_artifact_status(&self, id: &str, status: &str) -> Result<(), String> {
            if let Some(summary) = self.summaries.lock().await.get_mut(id) {
                summary.status = status.to_string();
            }
            Ok(())
        }

        async fn get_all_summaries(&self) -> Vec<ArtifactSummary> {
            self.summaries.lock().await.values().cloned().collect()
        }
    }

    pub struct StaticRoleRegistry;

    impl super::RoleRegistry for StaticRoleRegistry {
        fn get_provider_profile_for_role(&self, _role: &str) -> Option<String> {
            Some("default".to_string())
        }

        fn get_mode_for_role(&self, _role: &str) -> Option<String> {
            Some("code".to_string())
        }
    }

    #[derive(Default)]
    pub struct MockAgentLookup {
        pub deliverable: Mutex<Vec<String>>,
        pub known: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentLookup for MockAgentLookup {
        async fn is_known(&self, agent_id: &str) -> bool {
            self.deliverable.lock().await.iter().any(|id| id == agent_id)
                || self.known.lock().await.iter().any(|id| id == agent_id)
        }

        async fn is_deliverable(&self, agent_id: &str) -> bool {
            self.deliverable.lock().await.iter().any(|id| id == agent_id)
        }

        async fn active_agent_ids(&self) -> Vec<String> {
            self.deliverable.lock().await.clone()
        }

        async fn deliver(&self, _agent_id: &str, _payload: serde_json::Value) -> Result<(), String> {
            Ok(())
        }
    }
}
