//! Crate-wide error types for the orchestration core.

use thiserror::Error;

use crate::wsm::WorkflowState;

/// Result alias used throughout `conductor-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced synchronously to callers for internal invariant violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A transition was attempted that is not in the transition table for the
    /// current state.
    #[error("invalid transition to {target:?} from {from:?}; valid targets: {valid:?}")]
    InvalidTransition {
        /// The state the transition was attempted from.
        from: WorkflowState,
        /// The state that was requested.
        target: WorkflowState,
        /// The set of targets that would have been legal.
        valid: Vec<WorkflowState>,
    },

    /// A lifecycle operation (`pause`/`resume`/`retry`) was called from a state
    /// that does not support it.
    #[error("invalid lifecycle operation {op} from state {state:?}")]
    InvalidLifecycleOp {
        /// Operation name (`pause`, `resume`, `retry`, `cancel`, `start_task`).
        op: &'static str,
        /// The state the operation was attempted from.
        state: WorkflowState,
    },

    /// The component has been disposed; no further operations are accepted.
    #[error("component disposed")]
    Disposed,

    /// A storage adapter operation failed.
    #[error("storage adapter error: {0}")]
    Storage(String),

    /// A checkpoint with the given id does not exist.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// The requested checkpoint/context operation is not applicable.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
