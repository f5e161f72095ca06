//! Troupe error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskState;
use crate::types::{ContextId, TaskId};

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, TroupeError>;

/// Errors that can occur in the orchestration core
#[derive(Debug, Error)]
pub enum TroupeError {
    /// Recursion would exceed the tree's depth bound
    #[error("Depth exceeded: context at depth {depth} cannot spawn beyond max depth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    /// Team formation cannot meet the requested size
    #[error("Insufficient candidates: requested {requested}, available {available}")]
    InsufficientCandidates { requested: usize, available: usize },

    /// State machine misuse
    #[error("Invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// Mutation attempted on a terminal task
    #[error("Task {task_id} is finalized in state {state}")]
    TaskFinalized { task_id: TaskId, state: TaskState },

    /// Dispatch exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The invoked agent failed
    #[error("Agent error: {0}")]
    AgentError(String),

    /// Inbound request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Caller-supplied context id was already issued
    #[error("Context already exists: {0}")]
    DuplicateContext(ContextId),

    /// Candidate source failure
    #[error("Registry error: {0}")]
    Registry(String),

    /// No paused task with this id is waiting to be resumed
    #[error("Task {0} is not waiting for input")]
    NotPaused(TaskId),

    /// Stream for this context has been closed
    #[error("Stream closed for {0}")]
    StreamClosed(ContextId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TroupeError {
    /// Classification recorded on a failed task, if this error is a task outcome
    pub fn task_error_kind(&self) -> TaskErrorKind {
        match self {
            TroupeError::Timeout(_) => TaskErrorKind::Timeout,
            TroupeError::DepthExceeded { .. } => TaskErrorKind::DepthExceeded,
            TroupeError::InsufficientCandidates { .. } => TaskErrorKind::Formation,
            _ => TaskErrorKind::AgentError,
        }
    }
}

/// Failure classification stored on a [`crate::task::Task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Timeout,
    AgentError,
    DepthExceeded,
    Formation,
    Cancelled,
    Rejected,
}

/// Error recorded on a task that ended in a failure state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&TroupeError> for TaskError {
    fn from(err: &TroupeError) -> Self {
        // AgentError keeps the agent's own message untouched
        let message = match err {
            TroupeError::AgentError(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self::new(err.task_error_kind(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_agent_error_message_is_verbatim() {
        let err = TroupeError::AgentError("rate limited: retry in 3s".into());
        let task_err = TaskError::from(&err);
        assert_eq!(task_err.kind, TaskErrorKind::AgentError);
        assert_eq!(task_err.message, "rate limited: retry in 3s");
    }

    #[test]
    fn test_timeout_classification() {
        let err = TroupeError::Timeout(Duration::from_secs(5));
        assert_eq!(err.task_error_kind(), TaskErrorKind::Timeout);
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_insufficient_candidates_display() {
        let err = TroupeError::InsufficientCandidates {
            requested: 4,
            available: 2,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient candidates: requested 4, available 2"
        );
    }
}
