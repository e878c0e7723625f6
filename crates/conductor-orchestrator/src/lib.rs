//! Agent Pool Manager, Message Router, Error Recovery Manager, and the
//! orchestrator façade that composes them with `conductor-core`'s Workflow
//! State Machine and Checkpoint subsystem.

pub mod erm;
pub mod interfaces;
pub mod orchestrator;
pub mod pool;
pub mod router;

pub use erm::{
    CircuitBreakerConfig, Condition, ConditionOp, ErmError, ErrorContext, ErrorRecoveryManager,
    ErrorType, RecoveryEvent, RecoveryResult, RecoveryStrategy, Severity, Statistics, StrategyType,
};
pub use interfaces::{
    AgentLookup, ArtifactStore, ArtifactSummary, FileLockService, LockHandleInfo, LockMode,
    ProcessRuntime, ProviderSettingsResolver, RoleRegistry, RuntimeControlMessage, RuntimeEvent,
    RuntimeEventKind,
};
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use pool::{AgentInstance, AgentPoolManager, AgentSpawnConfig, AgentStatus, HealthStatus, PoolConfig, PoolEvent};
pub use router::{
    AgentMessage, MessageRouter, MessageType, RouterError, RouterEvent, SubscriptionFilter,
    BROADCAST_TARGET,
};
