//! Dependency-free primitives of the orchestration core: the Workflow State
//! Machine, the Context Window Monitor, and the Checkpoint service that
//! snapshots both.

pub mod checkpoint;
pub mod context;
pub mod error;
pub mod storage;
pub mod wsm;

pub use checkpoint::{CheckpointBridge, CheckpointService, RollbackEvent, WorkflowCheckpoint};
pub use context::{ContextEvent, ContextItem, ContextMonitor, ContextMonitorConfig};
pub use error::{CoreError, Result};
pub use storage::{InMemoryStorageAdapter, StorageAdapter};
pub use wsm::{WorkflowContext, WorkflowEvent, WorkflowState, WorkflowStateMachine};
