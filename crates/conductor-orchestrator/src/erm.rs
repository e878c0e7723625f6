//! Error Recovery Manager: converts raw failures into bounded, observable
//! recovery attempts, gated by a per-key circuit breaker.
//!
//! Grounded on `radium_orchestrator::routing::circuit_breaker::CircuitBreaker`
//! (state machine `Closed`/`Open(SystemTime)`/`HalfOpen`, cooldown-driven
//! half-open transition) adapted from a continuous failure-rate gate to the
//! discrete count-in-window gate this design calls for, and on
//! `radium_core::workflow::failure::{FailureHistory, FailurePolicy}` for the
//! history-then-policy shape of `should_retry`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use conductor_core::checkpoint::CheckpointService;

use crate::interfaces::AgentLookup;
use crate::pool::AgentPoolManager;
use crate::router::{AgentMessage, MessageRouter, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    AgentFailure,
    AgentTimeout,
    AgentUnhealthy,
    TaskExecutionError,
    MessageDeliveryError,
    CheckpointError,
    ResourceExhausted,
    RateLimitExceeded,
    ProviderError,
    ValidationError,
    UnknownError,
}

impl ErrorType {
    fn default_severity(self) -> Severity {
        use ErrorType::*;
        match self {
            AgentFailure | AgentUnhealthy | ProviderError | CheckpointError => Severity::High,
            ResourceExhausted => Severity::Critical,
            AgentTimeout | TaskExecutionError | MessageDeliveryError | UnknownError => Severity::Medium,
            RateLimitExceeded | ValidationError => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error_id: String,
    pub error_type: ErrorType,
    pub severity: Option<Severity>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub workflow_state: Option<String>,
    pub message_context: Option<AgentMessage>,
    pub retry_count: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    fn resolved_severity(&self) -> Severity {
        self.severity.unwrap_or_else(|| self.error_type.default_severity())
    }

    fn circuit_key(&self) -> String {
        self.agent_id.clone().unwrap_or_else(|| format!("{:?}", self.error_type))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyType {
    Retry,
    Reassign,
    Rollback,
    RestartAgent,
    GracefulDegradation,
    Abort,
    NotifyUser,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionOp {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    In,
    NotIn,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    pub value: serde_json::Value,
}

impl Condition {
    fn field_value(&self, ctx: &ErrorContext) -> serde_json::Value {
        match self.field.as_str() {
            "errorType" => serde_json::json!(format!("{:?}", ctx.error_type)),
            "severity" => serde_json::json!(format!("{:?}", ctx.resolved_severity())),
            "retryCount" => serde_json::json!(ctx.retry_count),
            "agentId" => serde_json::json!(ctx.agent_id),
            other => ctx.metadata.get(other).cloned().unwrap_or(serde_json::Value::Null),
        }
    }

    fn matches(&self, ctx: &ErrorContext) -> bool {
        let actual = self.field_value(ctx);
        match self.op {
            ConditionOp::Equals => actual == self.value,
            ConditionOp::NotEquals => actual != self.value,
            ConditionOp::GreaterThan => as_f64(&actual) > as_f64(&self.value),
            ConditionOp::LessThan => as_f64(&actual) < as_f64(&self.value),
            ConditionOp::In => self.value.as_array().is_some_and(|v| v.contains(&actual)),
            ConditionOp::NotIn => self.value.as_array().is_some_and(|v| !v.contains(&actual)),
        }
    }
}

fn as_f64(v: &serde_json::Value) -> f64 {
    v.as_f64().unwrap_or(0.0)
}

#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pub strategy_type: StrategyType,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub exponential_backoff: bool,
    pub max_delay_ms: Option<u64>,
    pub conditions: Vec<Condition>,
    pub preferred_role: Option<String>,
    pub reduce_parallelism: bool,
}

impl RecoveryStrategy {
    fn new(strategy_type: StrategyType, max_attempts: u32) -> Self {
        Self {
            strategy_type,
            max_attempts,
            delay_ms: 1_000,
            exponential_backoff: false,
            max_delay_ms: None,
            conditions: Vec::new(),
            preferred_role: None,
            reduce_parallelism: false,
        }
    }

    fn exp(mut self, delay_ms: u64, max_delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self.exponential_backoff = true;
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    fn delay(&self, attempt: u32) -> StdDuration {
        if !self.exponential_backoff {
            return StdDuration::from_millis(self.delay_ms);
        }
        let scaled = self.delay_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = self.max_delay_ms.map(|max| scaled.min(max)).unwrap_or(scaled);
        StdDuration::from_millis(capped)
    }
}

fn default_strategies(error_type: ErrorType) -> Vec<RecoveryStrategy> {
    use ErrorType::*;
    use StrategyType::*;
    match error_type {
        AgentFailure => vec![
            RecoveryStrategy::new(RestartAgent, 2),
            RecoveryStrategy::new(Reassign, 1),
        ],
        AgentTimeout => vec![RecoveryStrategy::new(Retry, 3).exp(1_000, 30_000)],
        AgentUnhealthy => vec![RecoveryStrategy::new(RestartAgent, 3).exp(5_000, 30_000)],
        TaskExecutionError => vec![RecoveryStrategy::new(Retry, 3).exp(1_000, 30_000), RecoveryStrategy::new(Rollback, 1)],
        MessageDeliveryError => vec![RecoveryStrategy::new(Retry, 3).exp(500, 30_000)],
        CheckpointError => vec![RecoveryStrategy::new(NotifyUser, 1)],
        ResourceExhausted => vec![RecoveryStrategy::new(GracefulDegradation, 1)],
        RateLimitExceeded => vec![RecoveryStrategy::new(Retry, 5).exp(1_000, 60_000)],
        ProviderError => vec![RecoveryStrategy::new(Retry, 3).exp(2_000, 30_000)],
        ValidationError => vec![RecoveryStrategy::new(NotifyUser, 1)],
        UnknownError => vec![RecoveryStrategy::new(Rollback, 1), RecoveryStrategy::new(NotifyUser, 1)],
    }
}

/// `notify_user` terminates every chain it appears in (directly or
/// transitively) and never counts as a real recovery — it only tells the
/// user the manager gave up. `restart_agent`'s own chain deliberately omits
/// it, reaching `notify_user` only by falling further through `reassign` or
/// `rollback`.
fn fallback_chain(strategy_type: StrategyType) -> Vec<StrategyType> {
    use StrategyType::*;
    match strategy_type {
        Retry => vec![Reassign, Rollback, NotifyUser],
        Reassign => vec![Rollback, NotifyUser],
        Rollback => vec![NotifyUser],
        RestartAgent => vec![Reassign, Rollback],
        GracefulDegradation => vec![NotifyUser],
        Abort => vec![NotifyUser],
        NotifyUser => vec![],
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy_used: StrategyType,
    pub attempts: u32,
    pub new_agent_id: Option<String>,
    pub restored_checkpoint_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitEntry {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    window_start: SystemTime,
    opened_at: Option<SystemTime>,
}

impl CircuitEntry {
    fn new() -> Self {
        Self { state: CircuitState::Closed, failure_count: 0, success_count: 0, window_start: SystemTime::now(), opened_at: None }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, failure_window_ms: 60_000, reset_timeout_ms: 30_000, success_threshold: 2 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub total_errors: u64,
    pub by_type: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub total_recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub circuit_breaker_opens: u64,
    pub graceful_degradation_activations: u64,
    pub user_notifications_sent: u64,
    pub last_error_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    RecoverySuccess { error_id: String, strategy: StrategyType },
    RecoveryFailed { error_id: String, strategy: StrategyType },
    UserNotification { severity: Severity, title: String, message: String, require_action: bool, timeout_ms: Option<u64> },
}

#[derive(Debug, thiserror::Error)]
pub enum ErmError {
    #[error("error recovery manager is disposed")]
    Disposed,
    #[error("no recovery strategy available and fallbacks disabled")]
    NoStrategy,
}

/// Converts failures into bounded recovery attempts with circuit-breaker gating.
pub struct ErrorRecoveryManager {
    pool: Arc<AgentPoolManager>,
    router: Arc<MessageRouter>,
    checkpoint: Arc<CheckpointService>,
    breaker_config: CircuitBreakerConfig,
    custom_strategies: StdRwLock<HashMap<ErrorType, Vec<RecoveryStrategy>>>,
    circuits: StdRwLock<HashMap<String, CircuitEntry>>,
    stats: StdRwLock<Statistics>,
    history: StdRwLock<VecDeque<ErrorContext>>,
    events: tokio::sync::broadcast::Sender<RecoveryEvent>,
    enable_fallbacks: bool,
    disposed: std::sync::atomic::AtomicBool,
}

const HISTORY_CAPACITY: usize = 200;

impl ErrorRecoveryManager {
    #[must_use]
    pub fn new(
        pool: Arc<AgentPoolManager>,
        router: Arc<MessageRouter>,
        checkpoint: Arc<CheckpointService>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(256);
        Self {
            pool,
            router,
            checkpoint,
            breaker_config,
            custom_strategies: StdRwLock::new(HashMap::new()),
            circuits: StdRwLock::new(HashMap::new()),
            stats: StdRwLock::new(Statistics::default()),
            history: StdRwLock::new(VecDeque::new()),
            events,
            enable_fallbacks: true,
            disposed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    pub fn set_strategies(&self, error_type: ErrorType, strategies: Vec<RecoveryStrategy>) {
        self.custom_strategies.write().unwrap().insert(error_type, strategies);
    }

    fn strategies_for(&self, error_type: ErrorType) -> Vec<RecoveryStrategy> {
        self.custom_strategies
            .read()
            .unwrap()
            .get(&error_type)
            .cloned()
            .unwrap_or_else(|| default_strategies(error_type))
    }

    fn select_strategy(&self, ctx: &ErrorContext) -> RecoveryStrategy {
        let candidates = self.strategies_for(ctx.error_type);
        candidates
            .iter()
            .find(|s| !s.conditions.is_empty() && s.conditions.iter().all(|c| c.matches(ctx)))
            .or_else(|| candidates.first())
            .cloned()
            .unwrap_or_else(|| RecoveryStrategy::new(StrategyType::Retry, 3).exp(1_000, 30_000))
    }

    pub async fn handle_error(&self, mut ctx: ErrorContext) -> Result<RecoveryResult, ErmError> {
        if self.disposed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(ErmError::Disposed);
        }
        self.record_stats(&ctx);

        let key = ctx.circuit_key();
        if let Some(short_circuit) = self.check_circuit(&key) {
            return Ok(short_circuit);
        }

        let strategy = self.select_strategy(&ctx);
        let (result, primary_succeeded) = self.execute_with_fallbacks(&mut ctx, strategy).await;
        // The circuit tracks whether the *chosen* strategy actually recovered
        // the error, not whether a terminal `notify_user` fallback made the
        // overall call return success — a breaker that closes every time the
        // user gets told "we gave up" would never open.
        self.record_circuit_outcome(&key, primary_succeeded);
        Ok(result)
    }

    fn record_stats(&self, ctx: &ErrorContext) {
        let mut stats = self.stats.write().unwrap();
        stats.total_errors += 1;
        *stats.by_type.entry(format!("{:?}", ctx.error_type)).or_insert(0) += 1;
        *stats.by_severity.entry(format!("{:?}", ctx.resolved_severity())).or_insert(0) += 1;
        stats.last_error_timestamp = Some(Utc::now());
        drop(stats);
        let mut history = self.history.write().unwrap();
        history.push_front(ctx.clone());
        while history.len() > HISTORY_CAPACITY {
            history.pop_back();
        }
    }

    fn check_circuit(&self, key: &str) -> Option<RecoveryResult> {
        let mut circuits = self.circuits.write().unwrap();
        let entry = circuits.entry(key.to_string()).or_insert_with(CircuitEntry::new);

        if entry.state == CircuitState::Open {
            if let Some(opened_at) = entry.opened_at {
                if opened_at.elapsed().unwrap_or_default() >= StdDuration::from_millis(self.breaker_config.reset_timeout_ms) {
                    entry.state = CircuitState::HalfOpen;
                    entry.success_count = 0;
                } else {
                    return Some(RecoveryResult {
                        success: false,
                        strategy_used: StrategyType::GracefulDegradation,
                        attempts: 0,
                        new_agent_id: None,
                        restored_checkpoint_id: None,
                        message: format!("circuit open for {key}"),
                    });
                }
            }
        }
        None
    }

    fn record_circuit_outcome(&self, key: &str, success: bool) {
        let mut circuits = self.circuits.write().unwrap();
        let entry = circuits.entry(key.to_string()).or_insert_with(CircuitEntry::new);

        if entry.window_start.elapsed().unwrap_or_default() >= StdDuration::from_millis(self.breaker_config.failure_window_ms) {
            entry.failure_count = 0;
            entry.window_start = SystemTime::now();
        }

        if success {
            match entry.state {
                CircuitState::HalfOpen => {
                    entry.success_count += 1;
                    if entry.success_count >= self.breaker_config.success_threshold {
                        entry.state = CircuitState::Closed;
                        entry.failure_count = 0;
                        entry.opened_at = None;
                    }
                }
                CircuitState::Closed => {
                    entry.failure_count = 0;
                }
                CircuitState::Open => {}
            }
        } else {
            match entry.state {
                CircuitState::HalfOpen => {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(SystemTime::now());
                }
                CircuitState::Closed => {
                    entry.failure_count += 1;
                    if entry.failure_count >= self.breaker_config.failure_threshold {
                        entry.state = CircuitState::Open;
                        entry.opened_at = Some(SystemTime::now());
                        drop(circuits);
                        self.stats.write().unwrap().circuit_breaker_opens += 1;
                        warn!(%key, "circuit breaker opened");
                        return;
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    /// Walks the fallback chain until a strategy succeeds or the chain is
    /// exhausted. Returns the final result alongside whether the originally
    /// *selected* strategy recovered the error on its own — the only signal
    /// the circuit breaker should act on.
    async fn execute_with_fallbacks(&self, ctx: &mut ErrorContext, strategy: RecoveryStrategy) -> (RecoveryResult, bool) {
        let mut current = strategy;
        let mut primary_outcome: Option<bool> = None;
        loop {
            let result = self.execute_strategy(ctx, &current).await;
            if primary_outcome.is_none() {
                primary_outcome = Some(result.success);
            }
            let primary_succeeded = primary_outcome.unwrap();
            if result.success {
                let _ = self.events.send(RecoveryEvent::RecoverySuccess { error_id: ctx.error_id.clone(), strategy: current.strategy_type });
                self.stats.write().unwrap().successful_recoveries += 1;
                return (result, primary_succeeded);
            }
            let _ = self.events.send(RecoveryEvent::RecoveryFailed { error_id: ctx.error_id.clone(), strategy: current.strategy_type });

            if !self.enable_fallbacks {
                self.stats.write().unwrap().failed_recoveries += 1;
                return (result, primary_succeeded);
            }
            let chain = fallback_chain(current.strategy_type);
            match chain.first() {
                Some(next) => {
                    current = RecoveryStrategy::new(*next, 1);
                }
                None => {
                    self.stats.write().unwrap().failed_recoveries += 1;
                    return (result, primary_succeeded);
                }
            }
        }
    }

    async fn execute_strategy(&self, ctx: &mut ErrorContext, strategy: &RecoveryStrategy) -> RecoveryResult {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.stats.write().unwrap().total_recovery_attempts += 1;
            let outcome = self.run_strategy_once(ctx, strategy).await;
            if outcome.success || attempt >= strategy.max_attempts {
                let mut outcome = outcome;
                outcome.attempts = attempt;
                return outcome;
            }
            sleep(strategy.delay(attempt)).await;
        }
    }

    async fn run_strategy_once(&self, ctx: &mut ErrorContext, strategy: &RecoveryStrategy) -> RecoveryResult {
        use StrategyType::*;
        let base = RecoveryResult {
            success: false,
            strategy_used: strategy.strategy_type,
            attempts: 1,
            new_agent_id: None,
            restored_checkpoint_id: None,
            message: String::new(),
        };
        match strategy.strategy_type {
            Retry => self.strategy_retry(ctx, base).await,
            Reassign => self.strategy_reassign(ctx, strategy, base).await,
            Rollback => self.strategy_rollback(ctx, base).await,
            RestartAgent => self.strategy_restart_agent(ctx, base).await,
            GracefulDegradation => self.strategy_graceful_degradation(strategy, base).await,
            Abort => self.strategy_abort(base).await,
            NotifyUser => self.strategy_notify_user(ctx, base).await,
        }
    }

    async fn strategy_retry(&self, ctx: &mut ErrorContext, mut result: RecoveryResult) -> RecoveryResult {
        let Some(original) = ctx.message_context.clone() else {
            result.message = "no message context to retry".to_string();
            return result;
        };
        ctx.retry_count += 1;
        let retried = AgentMessage {
            id: format!("{}_retry_{}", original.id, ctx.retry_count),
            message_type: original.message_type,
            from: original.from,
            to: original.to,
            timestamp: Utc::now(),
            payload: original.payload,
            correlation_id: original.correlation_id,
        };
        match self.router.route_message(retried).await {
            Ok(()) => {
                result.success = true;
                result.message = "retried".to_string();
            }
            Err(err) => result.message = err.to_string(),
        }
        result
    }

    async fn strategy_reassign(&self, ctx: &ErrorContext, strategy: &RecoveryStrategy, mut result: RecoveryResult) -> RecoveryResult {
        let failing = ctx.agent_id.clone().unwrap_or_default();
        let candidates = self.pool.get_active_agents().await;
        let chosen = candidates
            .iter()
            .find(|a| a.agent_id != failing && strategy.preferred_role.as_deref() == Some(a.role.as_str()))
            .or_else(|| candidates.iter().find(|a| a.agent_id != failing));
        match chosen {
            Some(agent) => {
                let payload = ctx.message_context.as_ref().map(|m| m.payload.clone()).unwrap_or(serde_json::Value::Null);
                if self.pool.deliver_via_lookup(&agent.agent_id, payload).await.is_ok() {
                    result.success = true;
                    result.new_agent_id = Some(agent.agent_id.clone());
                    result.message = "reassigned".to_string();
                } else {
                    result.message = "delivery to reassigned agent failed".to_string();
                }
            }
            None => result.message = "no alternate agent available".to_string(),
        }
        result
    }

    async fn strategy_rollback(&self, ctx: &ErrorContext, mut result: RecoveryResult) -> RecoveryResult {
        let session_id = ctx.session_id.clone().unwrap_or_default();
        match self.checkpoint.get_latest(&session_id).await {
            Some(checkpoint) => match self.checkpoint.restore(&checkpoint.id, Default::default()).await {
                Ok(_rollback) => {
                    result.success = true;
                    result.restored_checkpoint_id = Some(checkpoint.id);
                    result.message = "rolled back".to_string();
                }
                Err(err) => result.message = err.to_string(),
            },
            None => result.message = "no checkpoint to restore".to_string(),
        }
        result
    }

    async fn strategy_restart_agent(&self, ctx: &ErrorContext, mut result: RecoveryResult) -> RecoveryResult {
        let Some(agent_id) = ctx.agent_id.clone() else {
            result.message = "no agent id to restart".to_string();
            return result;
        };
        match self.pool.restart(&agent_id).await {
            Ok(true) => {
                result.success = true;
                result.message = "agent restarted".to_string();
            }
            Ok(false) => result.message = "restart failed to respawn".to_string(),
            Err(err) => result.message = err,
        }
        result
    }

    async fn strategy_graceful_degradation(&self, strategy: &RecoveryStrategy, mut result: RecoveryResult) -> RecoveryResult {
        self.stats.write().unwrap().graceful_degradation_activations += 1;
        if strategy.reduce_parallelism {
            let active = self.pool.get_active_agents().await;
            let target = self.pool.config_max_concurrent_agents();
            let excess = active.len().saturating_sub(target);
            for agent in active.into_iter().take(excess) {
                let _ = self.pool.pause(&agent.agent_id).await;
            }
        }
        result.success = true;
        result.message = "degraded gracefully".to_string();
        result
    }

    async fn strategy_abort(&self, mut result: RecoveryResult) -> RecoveryResult {
        for agent in self.pool.get_active_agents().await {
            let _ = self.pool.terminate(&agent.agent_id).await;
        }
        result.success = true;
        result.message = "aborted all active agents".to_string();
        result
    }

    async fn strategy_notify_user(&self, ctx: &ErrorContext, mut result: RecoveryResult) -> RecoveryResult {
        self.stats.write().unwrap().user_notifications_sent += 1;
        let _ = self.events.send(RecoveryEvent::UserNotification {
            severity: ctx.resolved_severity(),
            title: format!("{:?}", ctx.error_type),
            message: ctx.metadata.get("message").and_then(|v| v.as_str()).unwrap_or("an error occurred").to_string(),
            require_action: ctx.resolved_severity() >= Severity::High,
            timeout_ms: None,
        });
        result.success = true;
        result.message = "user notified".to_string();
        result
    }

    pub fn get_statistics(&self) -> Statistics {
        self.stats.read().unwrap().clone()
    }

    pub fn get_error_history(&self, limit: usize) -> Vec<ErrorContext> {
        self.history.read().unwrap().iter().take(limit).cloned().collect()
    }

    pub fn dispose(&self) {
        self.disposed.store(true, std::sync::atomic::Ordering::Release);
        info!("error recovery manager disposed");
    }
}
