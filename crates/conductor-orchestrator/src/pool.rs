//! Agent Pool Manager: supervises at most `maxConcurrentAgents` live worker
//! processes, tracks their status, and runs a background health monitor with
//! auto-restart.
//!
//! Grounded on `radium_orchestrator::lifecycle::AgentLifecycle` (transition
//! table + `Arc<RwLock<HashMap<...>>>` ownership) merged with
//! `radium_orchestrator::registry::AgentRegistry` (entry bookkeeping), with
//! the periodic health tick modeled on
//! `radium_orchestrator::dispatcher::TaskDispatcher`'s `tokio::select!` loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::interfaces::{
    AgentLookup, FileLockService, ProcessRuntime, RuntimeControlMessage, RuntimeEvent,
    RuntimeEventKind,
};

/// Status of a live supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Spawning,
    Ready,
    Busy,
    Paused,
    Stopped,
    Error,
}

impl AgentStatus {
    fn counts_as_active(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

/// Health as tracked by the monitor, derived only from observed agent events
/// — never from a stubbed liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Recovering,
}

/// Immutable record used to re-spawn an agent identically on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpawnConfig {
    pub agent_id: String,
    pub role: String,
    pub mode: String,
    pub provider_profile: String,
    pub workspace: String,
    pub task: Option<String>,
    pub session_id: Option<String>,
    pub custom_modes: Option<Vec<String>>,
    pub auto_approve: Option<bool>,
}

/// A live supervised worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub agent_id: String,
    pub role: String,
    pub mode: String,
    pub provider_profile: String,
    pub status: AgentStatus,
    pub session_id: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub restart_attempts: u32,
}

/// Tunables for admission control and the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_concurrent_agents: usize,
    pub check_interval_ms: u64,
    pub failure_threshold: u32,
    pub unresponsive_threshold_ms: i64,
    pub recovery_threshold: u32,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub restart_cooldown_ms: i64,
    pub ping_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 5,
            check_interval_ms: 5_000,
            failure_threshold: 3,
            unresponsive_threshold_ms: 30_000,
            recovery_threshold: 2,
            auto_restart: true,
            max_restart_attempts: 3,
            restart_cooldown_ms: 10_000,
            ping_timeout_ms: 5_000,
        }
    }
}

/// Events emitted by the pool and its health monitor.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    AgentHealthy { agent_id: String },
    AgentUnhealthy { agent_id: String },
    AgentRecovering { agent_id: String },
    HealthCheckCompleted,
    AgentRestartAttempt { agent_id: String },
    AgentRestartSuccess { agent_id: String, new_agent_id: String },
    AgentRestartFailed { agent_id: String, reason: String },
    AgentMaxRestartsReached { agent_id: String },
}

struct Inner {
    instances: HashMap<String, AgentInstance>,
    configs: HashMap<String, AgentSpawnConfig>,
    consecutive_misses: HashMap<String, u32>,
    consecutive_successes: HashMap<String, u32>,
    last_restart_at: HashMap<String, DateTime<Utc>>,
}

/// Supervises agent worker processes.
pub struct AgentPoolManager {
    runtime: Arc<dyn ProcessRuntime>,
    lock_service: Arc<dyn FileLockService>,
    config: PoolConfig,
    inner: RwLock<Inner>,
    events: broadcast::Sender<PoolEvent>,
    health_shutdown: RwLock<Option<watch::Sender<()>>>,
}

impl std::fmt::Debug for AgentPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.try_read().map(|i| i.instances.len()).unwrap_or(0);
        f.debug_struct("AgentPoolManager").field("instances", &count).finish_non_exhaustive()
    }
}

impl AgentPoolManager {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ProcessRuntime>,
        lock_service: Arc<dyn FileLockService>,
        config: PoolConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            runtime,
            lock_service,
            config,
            inner: RwLock::new(Inner {
                instances: HashMap::new(),
                configs: HashMap::new(),
                consecutive_misses: HashMap::new(),
                consecutive_successes: HashMap::new(),
                last_restart_at: HashMap::new(),
            }),
            events,
            health_shutdown: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub async fn spawn(&self, config: AgentSpawnConfig) -> Result<String, String> {
        {
            let inner = self.inner.read().await;
            if inner.instances.contains_key(&config.agent_id) {
                return Err(format!("agent already known: {}", config.agent_id));
            }
            let active = inner.instances.values().filter(|i| i.status.counts_as_active()).count();
            if active >= self.config.max_concurrent_agents {
                return Err("Maximum concurrent agents".to_string());
            }
        }

        let instance = AgentInstance {
            agent_id: config.agent_id.clone(),
            role: config.role.clone(),
            mode: config.mode.clone(),
            provider_profile: config.provider_profile.clone(),
            status: AgentStatus::Spawning,
            session_id: None,
            spawned_at: Utc::now(),
            last_activity_at: Utc::now(),
            health_status: HealthStatus::Unknown,
            restart_attempts: 0,
        };
        {
            let mut inner = self.inner.write().await;
            inner.instances.insert(config.agent_id.clone(), instance);
            inner.configs.insert(config.agent_id.clone(), config.clone());
        }

        match self.runtime.spawn_process(&config.agent_id, &config).await {
            Ok(session_id) => {
                let mut inner = self.inner.write().await;
                if let Some(instance) = inner.instances.get_mut(&config.agent_id) {
                    instance.session_id = Some(session_id);
                }
                info!(agent_id = %config.agent_id, "agent spawned");
                Ok(config.agent_id)
            }
            Err(err) => {
                let mut inner = self.inner.write().await;
                inner.instances.remove(&config.agent_id);
                inner.configs.remove(&config.agent_id);
                Err(err)
            }
        }
    }

    pub async fn terminate(&self, agent_id: &str) -> Result<(), String> {
        self.release_locks(agent_id).await;
        self.send_control(agent_id, RuntimeControlMessage::Shutdown).await?;
        self.set_status(agent_id, AgentStatus::Stopped).await
    }

    pub async fn pause(&self, agent_id: &str) -> Result<(), String> {
        {
            let inner = self.inner.read().await;
            let status = inner
                .instances
                .get(agent_id)
                .map(|i| i.status)
                .ok_or_else(|| format!("unknown agent: {agent_id}"))?;
            if !matches!(status, AgentStatus::Ready | AgentStatus::Busy) {
                return Err(format!("cannot pause agent in status {status:?}"));
            }
        }
        self.send_control(agent_id, RuntimeControlMessage::Pause).await?;
        self.set_status(agent_id, AgentStatus::Paused).await
    }

    pub async fn resume(&self, agent_id: &str) -> Result<(), String> {
        {
            let inner = self.inner.read().await;
            let status = inner
                .instances
                .get(agent_id)
                .map(|i| i.status)
                .ok_or_else(|| format!("unknown agent: {agent_id}"))?;
            if status != AgentStatus::Paused {
                return Err(format!("cannot resume agent in status {status:?}"));
            }
        }
        self.send_control(agent_id, RuntimeControlMessage::Resume).await?;
        self.set_status(agent_id, AgentStatus::Ready).await
    }

    pub async fn restart(&self, agent_id: &str) -> Result<bool, String> {
        let config = {
            let inner = self.inner.read().await;
            inner.configs.get(agent_id).cloned().ok_or_else(|| format!("unknown agent: {agent_id}"))?
        };

        self.release_locks(agent_id).await;
        let _ = self.send_control(agent_id, RuntimeControlMessage::Shutdown).await;

        {
            let mut inner = self.inner.write().await;
            inner.instances.remove(agent_id);
            inner.configs.remove(agent_id);
            inner.consecutive_misses.remove(agent_id);
            inner.consecutive_successes.remove(agent_id);
        }

        let new_agent_id = format!("{}_{}", config.role, Utc::now().timestamp_millis());
        let new_config = AgentSpawnConfig { agent_id: new_agent_id.clone(), ..config };
        match self.spawn(new_config).await {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(%agent_id, %err, "restart failed to respawn agent");
                Ok(false)
            }
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentInstance> {
        self.inner.read().await.instances.get(agent_id).cloned()
    }

    pub async fn get_all_agents(&self) -> Vec<AgentInstance> {
        self.inner.read().await.instances.values().cloned().collect()
    }

    pub async fn get_active_agents(&self) -> Vec<AgentInstance> {
        self.inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.status.counts_as_active())
            .cloned()
            .collect()
    }

    pub async fn get_active_agent_count(&self) -> usize {
        self.inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.status.counts_as_active())
            .count()
    }

    pub async fn get_agents_by_health_status(&self, health: HealthStatus) -> Vec<AgentInstance> {
        self.inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.health_status == health)
            .cloned()
            .collect()
    }

    pub async fn agent_has_file_locks(&self, agent_id: &str) -> bool {
        self.lock_service.agent_has_locks(agent_id).await
    }

    pub async fn get_agent_file_locks(&self, agent_id: &str) -> Vec<String> {
        self.lock_service
            .get_locks_for_agent(agent_id)
            .await
            .into_iter()
            .map(|lock| lock.lock_id)
            .collect()
    }

    /// Updates last-activity timestamp from a received pong. Liveness is
    /// derived only from events actually observed; this is the sole signal
    /// the health monitor trusts.
    pub async fn handle_pong(&self, agent_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(instance) = inner.instances.get_mut(agent_id) {
            instance.last_activity_at = Utc::now();
        }
        inner.consecutive_misses.insert(agent_id.to_string(), 0);
    }

    pub async fn get_last_activity(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().await.instances.get(agent_id).map(|i| i.last_activity_at)
    }

    pub fn config_max_concurrent_agents(&self) -> usize {
        self.config.max_concurrent_agents
    }

    /// Delivers an application payload to a ready/busy agent. Equivalent to
    /// the [`AgentLookup::deliver`] trait method, exposed inherently so
    /// callers holding a concrete `Arc<AgentPoolManager>` need not import the
    /// trait.
    pub async fn deliver_via_lookup(&self, agent_id: &str, payload: serde_json::Value) -> Result<(), String> {
        self.send_control(agent_id, RuntimeControlMessage::AgentMessage(payload)).await
    }

    /// Applies an agent event delivered by the runtime collaborator.
    pub async fn apply_runtime_event(&self, event: RuntimeEvent) {
        match event.kind {
            RuntimeEventKind::SessionCreated => {
                let mut inner = self.inner.write().await;
                if let Some(instance) = inner.instances.get_mut(&event.agent_id) {
                    instance.status = AgentStatus::Ready;
                    instance.health_status = HealthStatus::Healthy;
                    instance.session_id = Some(event.session_id);
                    instance.last_activity_at = Utc::now();
                }
            }
            RuntimeEventKind::Complete => {
                let mut inner = self.inner.write().await;
                if let Some(instance) = inner.instances.get_mut(&event.agent_id) {
                    instance.status = AgentStatus::Ready;
                    instance.last_activity_at = Utc::now();
                }
            }
            RuntimeEventKind::Error => {
                {
                    let mut inner = self.inner.write().await;
                    if let Some(instance) = inner.instances.get_mut(&event.agent_id) {
                        instance.status = AgentStatus::Error;
                        instance.health_status = HealthStatus::Unhealthy;
                    }
                }
                self.release_locks(&event.agent_id).await;
                error!(agent_id = %event.agent_id, message = ?event.message, "agent reported error");
            }
            RuntimeEventKind::Interrupted => {
                {
                    let mut inner = self.inner.write().await;
                    if let Some(instance) = inner.instances.get_mut(&event.agent_id) {
                        instance.status = AgentStatus::Stopped;
                    }
                }
                self.release_locks(&event.agent_id).await;
            }
        }
    }

    /// Spawns the background health-monitor tick (grounded on
    /// `TaskDispatcher`'s `tokio::select!` poll loop). Idempotent.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(std::time::Duration::from_millis(pool.config.check_interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        pool.run_health_check().await;
                    }
                }
            }
        });
        if let Ok(mut guard) = self.health_shutdown.try_write() {
            *guard = Some(shutdown_tx);
        }
    }

    pub async fn stop_health_monitor(&self) {
        if let Some(tx) = self.health_shutdown.write().await.take() {
            let _ = tx.send(());
        }
    }

    async fn run_health_check(&self) {
        let agent_ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .instances
                .iter()
                .filter(|(_, i)| matches!(i.status, AgentStatus::Ready | AgentStatus::Busy | AgentStatus::Paused))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for agent_id in agent_ids {
            let _ = self.send_control(&agent_id, RuntimeControlMessage::Ping).await;
            self.evaluate_health(&agent_id).await;
        }
        let _ = self.events.send(PoolEvent::HealthCheckCompleted);
    }

    async fn evaluate_health(&self, agent_id: &str) {
        let (last_activity, current_health) = {
            let inner = self.inner.read().await;
            let Some(instance) = inner.instances.get(agent_id) else { return };
            (instance.last_activity_at, instance.health_status)
        };
        let elapsed_ms = (Utc::now() - last_activity).num_milliseconds();
        let missed = elapsed_ms > self.config.unresponsive_threshold_ms;

        let mut became_unhealthy = false;
        let mut became_recovering = false;
        let mut became_healthy = false;
        {
            let mut inner = self.inner.write().await;
            {
                let misses = inner.consecutive_misses.entry(agent_id.to_string()).or_insert(0);
                if missed {
                    *misses += 1;
                } else {
                    *misses = 0;
                }
            }
            {
                let successes = inner.consecutive_successes.entry(agent_id.to_string()).or_insert(0);
                if missed {
                    *successes = 0;
                } else {
                    *successes += 1;
                }
            }
            let misses = *inner.consecutive_misses.get(agent_id).unwrap();
            let successes = *inner.consecutive_successes.get(agent_id).unwrap();

            if let Some(instance) = inner.instances.get_mut(agent_id) {
                match current_health {
                    HealthStatus::Healthy | HealthStatus::Unknown => {
                        if misses >= self.config.failure_threshold {
                            instance.health_status = HealthStatus::Unhealthy;
                            became_unhealthy = true;
                        }
                    }
                    HealthStatus::Unhealthy => {
                        if !missed {
                            instance.health_status = HealthStatus::Recovering;
                            became_recovering = true;
                        }
                    }
                    HealthStatus::Recovering => {
                        if missed {
                            instance.health_status = HealthStatus::Unhealthy;
                            became_unhealthy = true;
                        } else if successes >= self.config.recovery_threshold {
                            instance.health_status = HealthStatus::Healthy;
                            became_healthy = true;
                        }
                    }
                }
            }
        }

        if became_unhealthy {
            let _ = self.events.send(PoolEvent::AgentUnhealthy { agent_id: agent_id.to_string() });
            self.maybe_auto_restart(agent_id).await;
        }
        if became_recovering {
            let _ = self.events.send(PoolEvent::AgentRecovering { agent_id: agent_id.to_string() });
        }
        if became_healthy {
            let _ = self.events.send(PoolEvent::AgentHealthy { agent_id: agent_id.to_string() });
        }
    }

    async fn maybe_auto_restart(&self, agent_id: &str) {
        if !self.config.auto_restart {
            return;
        }
        let (attempts, cooldown_ok) = {
            let inner = self.inner.read().await;
            let attempts = inner.instances.get(agent_id).map(|i| i.restart_attempts).unwrap_or(0);
            let cooldown_ok = inner
                .last_restart_at
                .get(agent_id)
                .map(|at| (Utc::now() - *at).num_milliseconds() >= self.config.restart_cooldown_ms)
                .unwrap_or(true);
            (attempts, cooldown_ok)
        };
        if attempts >= self.config.max_restart_attempts {
            let _ = self.events.send(PoolEvent::AgentMaxRestartsReached { agent_id: agent_id.to_string() });
            return;
        }
        if !cooldown_ok {
            return;
        }

        let _ = self.events.send(PoolEvent::AgentRestartAttempt { agent_id: agent_id.to_string() });
        {
            let mut inner = self.inner.write().await;
            inner.last_restart_at.insert(agent_id.to_string(), Utc::now());
            if let Some(instance) = inner.instances.get_mut(agent_id) {
                instance.restart_attempts += 1;
            }
        }
        match self.restart(agent_id).await {
            Ok(true) => {
                let _ = self.events.send(PoolEvent::AgentRestartSuccess {
                    agent_id: agent_id.to_string(),
                    new_agent_id: agent_id.to_string(),
                });
            }
            Ok(false) | Err(_) => {
                let _ = self.events.send(PoolEvent::AgentRestartFailed {
                    agent_id: agent_id.to_string(),
                    reason: "respawn failed".to_string(),
                });
            }
        }
    }

    /// Stops health monitoring, releases all locks, and fire-and-forgets a
    /// terminate for every live agent.
    pub async fn dispose(&self) {
        self.stop_health_monitor().await;
        let agent_ids: Vec<String> = self.inner.read().await.instances.keys().cloned().collect();
        for agent_id in agent_ids {
            self.release_locks(&agent_id).await;
            let _ = self.send_control(&agent_id, RuntimeControlMessage::Shutdown).await;
        }
        let mut inner = self.inner.write().await;
        inner.instances.clear();
        inner.configs.clear();
    }

    async fn release_locks(&self, agent_id: &str) {
        if let Err(err) = self.lock_service.release_all_locks_for_agent(agent_id).await {
            warn!(%agent_id, %err, "failed to release locks");
        }
    }

    async fn send_control(&self, agent_id: &str, message: RuntimeControlMessage) -> Result<(), String> {
        let session_id = {
            let inner = self.inner.read().await;
            inner
                .instances
                .get(agent_id)
                .and_then(|i| i.session_id.clone())
                .ok_or_else(|| format!("agent has no active session: {agent_id}"))?
        };
        self.runtime.send_message(&session_id, message).await
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), String> {
        let mut inner = self.inner.write().await;
        let instance = inner.instances.get_mut(agent_id).ok_or_else(|| format!("unknown agent: {agent_id}"))?;
        instance.status = status;
        debug!(%agent_id, ?status, "agent status updated");
        Ok(())
    }
}

#[async_trait::async_trait]
impl AgentLookup for AgentPoolManager {
    async fn is_known(&self, agent_id: &str) -> bool {
        self.inner.read().await.instances.contains_key(agent_id)
    }

    async fn is_deliverable(&self, agent_id: &str) -> bool {
        self.inner
            .read()
            .await
            .instances
            .get(agent_id)
            .map(|i| matches!(i.status, AgentStatus::Ready | AgentStatus::Busy))
            .unwrap_or(false)
    }

    async fn active_agent_ids(&self) -> Vec<String> {
        self.get_active_agents().await.into_iter().map(|i| i.agent_id).collect()
    }

    async fn deliver(&self, agent_id: &str, payload: serde_json::Value) -> Result<(), String> {
        self.send_control(agent_id, RuntimeControlMessage::AgentMessage(payload)).await
    }
}
