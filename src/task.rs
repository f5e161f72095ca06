//! Task lifecycle - per-task state machine with published transitions

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Result, TaskError, TaskErrorKind, TroupeError};
use crate::stream::{StreamEvent, StreamPublisher};
use crate::types::{AgentId, Artifact, ContextId, TaskId};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Working,
    Completed,
    Failed,
    Cancelled,
    /// Paused until the caller supplies more input
    InputRequired,
    Rejected,
    /// Paused until authorization is granted
    AuthRequired,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Rejected
        )
    }

    /// Waiting on something outside the task, may resume
    pub fn is_paused(&self) -> bool {
        matches!(self, TaskState::InputRequired | TaskState::AuthRequired)
    }

    /// Whether `next` is reachable from this state in one step
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        match self {
            Submitted => matches!(next, Working | Cancelled | Rejected),
            Working => matches!(
                next,
                Completed | Failed | Cancelled | InputRequired | Rejected | AuthRequired
            ),
            InputRequired | AuthRequired => matches!(next, Working | Cancelled | Failed),
            Completed | Failed | Cancelled | Rejected => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::InputRequired => "input_required",
            TaskState::Rejected => "rejected",
            TaskState::AuthRequired => "auth_required",
        };
        f.write_str(s)
    }
}

/// What a task tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// One agent dispatch
    Member { agent: AgentId },
    /// The aggregate of a team
    Coordination,
    /// A member's request for a sub-team
    Delegation { agent: AgentId },
}

/// One entry of a task's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

/// Unit-of-work record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub context_id: ContextId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub history: Vec<Transition>,
    pub artifacts: Vec<Artifact>,
    /// Only set in a terminal failure state
    pub error: Option<TaskError>,
}

impl Task {
    fn new(context_id: ContextId, kind: TaskKind) -> Self {
        Self {
            task_id: TaskId::new(),
            context_id,
            kind,
            state: TaskState::Submitted,
            history: vec![Transition {
                state: TaskState::Submitted,
                timestamp: Utc::now(),
                message: None,
            }],
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_coordination(&self) -> bool {
        matches!(self.kind, TaskKind::Coordination)
    }

    pub fn agent(&self) -> Option<&AgentId> {
        match &self.kind {
            TaskKind::Member { agent } | TaskKind::Delegation { agent } => Some(agent),
            TaskKind::Coordination => None,
        }
    }

    /// Whether the history is a legal walk of the state machine
    pub fn history_is_valid(&self) -> bool {
        let Some(first) = self.history.first() else {
            return false;
        };
        if first.state != TaskState::Submitted {
            return false;
        }

        let legal_steps = self
            .history
            .windows(2)
            .all(|pair| pair[0].state.can_transition_to(pair[1].state));
        let ordered = self
            .history
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp);
        let terminals = self.history.iter().filter(|t| t.state.is_terminal()).count();

        legal_steps && ordered && terminals <= 1
    }
}

/// Exclusive owner of one task while it is live
///
/// Every successful transition is appended to history and published to the
/// task's context stream. Once terminal, the task is frozen.
pub struct TaskTracker {
    task: Task,
    publisher: StreamPublisher,
}

impl TaskTracker {
    /// Track a new member task for `agent`
    pub fn member(context_id: ContextId, agent: AgentId, publisher: StreamPublisher) -> Self {
        Self::new(context_id, TaskKind::Member { agent }, publisher)
    }

    /// Track a new coordination task for a team
    pub fn coordination(context_id: ContextId, publisher: StreamPublisher) -> Self {
        Self::new(context_id, TaskKind::Coordination, publisher)
    }

    /// Track `agent`'s request to spawn a sub-team
    pub fn delegation(context_id: ContextId, agent: AgentId, publisher: StreamPublisher) -> Self {
        Self::new(context_id, TaskKind::Delegation { agent }, publisher)
    }

    fn new(context_id: ContextId, kind: TaskKind, publisher: StreamPublisher) -> Self {
        let task = Task::new(context_id, kind);
        let tracker = Self { task, publisher };
        tracker.emit(None, None);
        tracker
    }

    pub fn task_id(&self) -> TaskId {
        self.task.task_id
    }

    pub fn context_id(&self) -> ContextId {
        self.task.context_id
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }

    /// Move to `next`, recording and publishing the transition
    pub fn transition(&mut self, next: TaskState, message: Option<String>) -> Result<()> {
        self.ensure_live()?;

        let current = self.task.state;
        if !current.can_transition_to(next) {
            error!(
                task_id = %self.task.task_id,
                from = %current,
                to = %next,
                "Invalid task transition"
            );
            return Err(TroupeError::InvalidTransition {
                task_id: self.task.task_id,
                from: current,
                to: next,
            });
        }

        self.task.state = next;
        self.task.history.push(Transition {
            state: next,
            timestamp: Utc::now(),
            message: message.clone(),
        });

        debug!(
            task_id = %self.task.task_id,
            context_id = %self.task.context_id,
            from = %current,
            to = %next,
            "Task transition"
        );

        self.emit(Some(current), message);
        Ok(())
    }

    /// Terminate as `Failed`, recording why
    pub fn fail(&mut self, error: TaskError) -> Result<()> {
        self.finish_with_error(TaskState::Failed, error)
    }

    /// Terminate as `Cancelled`
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.finish_with_error(
            TaskState::Cancelled,
            TaskError::new(TaskErrorKind::Cancelled, reason),
        )
    }

    /// Terminate as `Rejected`
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.finish_with_error(
            TaskState::Rejected,
            TaskError::new(TaskErrorKind::Rejected, reason),
        )
    }

    fn finish_with_error(&mut self, state: TaskState, error: TaskError) -> Result<()> {
        let message = error.message.clone();
        self.transition(state, Some(message))?;
        self.task.error = Some(error);
        Ok(())
    }

    /// Attach an artifact and publish it
    pub fn add_artifact(&mut self, artifact: Artifact) -> Result<()> {
        self.ensure_live()?;

        self.task.artifacts.push(artifact.clone());
        let published = self.publisher.publish(StreamEvent::ArtifactUpdate {
            context_id: self.task.context_id,
            task_id: self.task.task_id,
            artifact,
            timestamp: Utc::now(),
        });
        self.note_dropped(published);
        Ok(())
    }

    /// Read-only copy of the current task
    pub fn snapshot(&self) -> Task {
        self.task.clone()
    }

    /// Release the task
    pub fn into_task(self) -> Task {
        self.task
    }

    fn ensure_live(&self) -> Result<()> {
        if self.task.state.is_terminal() {
            error!(task_id = %self.task.task_id, state = %self.task.state, "Mutation of finalized task");
            return Err(TroupeError::TaskFinalized {
                task_id: self.task.task_id,
                state: self.task.state,
            });
        }
        Ok(())
    }

    fn emit(&self, previous: Option<TaskState>, message: Option<String>) {
        let timestamp = self
            .task
            .history
            .last()
            .map(|t| t.timestamp)
            .unwrap_or_else(Utc::now);

        let published = self.publisher.publish(StreamEvent::TaskStatusUpdate {
            context_id: self.task.context_id,
            task_id: self.task.task_id,
            coordination: self.task.is_coordination(),
            previous_state: previous,
            current_state: self.task.state,
            message,
            timestamp,
        });
        self.note_dropped(published);
    }

    // Events after the stream closed are kept in task history only
    fn note_dropped(&self, published: Result<()>) {
        if let Err(err) = published {
            debug!(task_id = %self.task.task_id, error = %err, "Event not published");
        }
    }
}

/// Log a tracker mutation the caller could not recover from
///
/// Only reachable through a lifecycle bug, so the task is left as it was.
pub(crate) fn report_misuse(result: Result<()>) {
    if let Err(err) = result {
        error!(error = %err, "Task lifecycle misuse");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn create_tracker() -> (TaskTracker, StreamPublisher, ContextId) {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();
        let tracker = TaskTracker::member(ctx, AgentId::from("analyst"), publisher.clone());
        (tracker, publisher, ctx)
    }

    // === State Table Tests ===

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Rejected.is_terminal());
        assert!(!TaskState::InputRequired.is_terminal());
        assert!(!TaskState::AuthRequired.is_terminal());
        assert!(!TaskState::Working.is_terminal());
    }

    #[test]
    fn test_paused_states_can_resume_or_end() {
        for paused in [TaskState::InputRequired, TaskState::AuthRequired] {
            assert!(paused.can_transition_to(TaskState::Working));
            assert!(paused.can_transition_to(TaskState::Cancelled));
            assert!(paused.can_transition_to(TaskState::Failed));
            assert!(!paused.can_transition_to(TaskState::Completed));
        }
    }

    #[test]
    fn test_submitted_must_start_working_first() {
        assert!(!TaskState::Submitted.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Submitted.can_transition_to(TaskState::Failed));
        assert!(TaskState::Submitted.can_transition_to(TaskState::Cancelled));
    }

    // === Tracker Tests ===

    #[test]
    fn test_new_task_is_submitted() {
        let (tracker, publisher, ctx) = create_tracker();
        assert_eq!(tracker.state(), TaskState::Submitted);
        assert_eq!(tracker.snapshot().history.len(), 1);
        assert_eq!(publisher.history(&ctx).len(), 1);
    }

    #[test]
    fn test_happy_path_records_history() {
        let (mut tracker, publisher, ctx) = create_tracker();

        assert_ok!(tracker.transition(TaskState::Working, None));
        assert_ok!(tracker.add_artifact(Artifact::text("analyst_response", "done")));
        assert_ok!(tracker.transition(TaskState::Completed, Some("ok".into())));

        let task = tracker.into_task();
        let states: Vec<TaskState> = task.history.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Submitted, TaskState::Working, TaskState::Completed]
        );
        assert_eq!(task.artifacts.len(), 1);
        assert!(task.error.is_none());
        assert!(task.history_is_valid());

        // submitted, working, artifact, completed
        assert_eq!(publisher.history(&ctx).len(), 4);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (mut tracker, _publisher, _ctx) = create_tracker();
        let result = tracker.transition(TaskState::Completed, None);
        assert!(matches!(
            result,
            Err(TroupeError::InvalidTransition {
                from: TaskState::Submitted,
                to: TaskState::Completed,
                ..
            })
        ));
        assert_eq!(tracker.state(), TaskState::Submitted);
    }

    #[test]
    fn test_terminal_task_is_frozen() {
        let (mut tracker, _publisher, _ctx) = create_tracker();
        tracker.transition(TaskState::Working, None).unwrap();
        tracker.transition(TaskState::Completed, None).unwrap();

        let result = tracker.transition(TaskState::Working, None);
        assert!(matches!(result, Err(TroupeError::TaskFinalized { .. })));
        assert_err!(tracker.add_artifact(Artifact::text("late", "x")));
        assert_eq!(tracker.snapshot().history.len(), 3);
    }

    #[test]
    fn test_fail_records_error() {
        let (mut tracker, _publisher, _ctx) = create_tracker();
        tracker.transition(TaskState::Working, None).unwrap();
        tracker
            .fail(TaskError::new(TaskErrorKind::Timeout, "timed out after 5s"))
            .unwrap();

        let task = tracker.into_task();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::Timeout);
        assert_eq!(task.history.last().unwrap().message.as_deref(), Some("timed out after 5s"));
    }

    #[test]
    fn test_fail_from_submitted_is_invalid() {
        let (mut tracker, _publisher, _ctx) = create_tracker();
        let result = tracker.fail(TaskError::new(TaskErrorKind::AgentError, "boom"));
        assert!(matches!(result, Err(TroupeError::InvalidTransition { .. })));
        assert!(tracker.snapshot().error.is_none());
    }

    #[test]
    fn test_cancel_before_start() {
        let (mut tracker, _publisher, _ctx) = create_tracker();
        tracker.cancel("parent cancelled").unwrap();
        let task = tracker.into_task();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::Cancelled);
    }

    #[test]
    fn test_input_required_resumes() {
        let (mut tracker, _publisher, _ctx) = create_tracker();
        tracker.transition(TaskState::Working, None).unwrap();
        tracker
            .transition(TaskState::InputRequired, Some("which region?".into()))
            .unwrap();
        tracker.transition(TaskState::Working, None).unwrap();
        tracker.transition(TaskState::Completed, None).unwrap();
        assert!(tracker.snapshot().history_is_valid());
    }

    #[test]
    fn test_history_validation_catches_double_terminal() {
        let (mut tracker, _publisher, _ctx) = create_tracker();
        tracker.transition(TaskState::Working, None).unwrap();
        tracker.transition(TaskState::Completed, None).unwrap();

        let mut task = tracker.into_task();
        task.history.push(Transition {
            state: TaskState::Failed,
            timestamp: Utc::now(),
            message: None,
        });
        assert!(!task.history_is_valid());
    }

    #[tokio::test]
    async fn test_coordination_terminal_closes_stream() {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();
        let sub = publisher.subscribe(ctx);

        let mut coord = TaskTracker::coordination(ctx, publisher.clone());
        coord.transition(TaskState::Working, None).unwrap();
        coord.transition(TaskState::Completed, None).unwrap();

        let events = sub.collect().await;
        assert_eq!(events.len(), 3);
        assert!(publisher.is_closed(&ctx));
    }

    #[test]
    fn test_delegation_failure_keeps_stream_open() {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();

        let mut delegation = TaskTracker::delegation(ctx, AgentId::from("planner"), publisher.clone());
        assert_ok!(delegation.transition(TaskState::Working, None));
        assert_ok!(delegation.fail(TaskError::new(TaskErrorKind::DepthExceeded, "too deep")));

        let task = delegation.into_task();
        assert!(!task.is_coordination());
        assert_eq!(task.agent().map(AgentId::as_str), Some("planner"));
        assert!(!publisher.is_closed(&ctx));
    }
}
