//! Execution dispatcher - one agent call with timeout and cancellation

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TaskError, TroupeError};
use crate::prompt::ContextualPrompt;
use crate::task::{report_misuse, Task, TaskState, TaskTracker};
use crate::types::{AgentId, AgentRole, Artifact, ContextId, ExecutionStrategy, FormationStrategy};

/// Default per-dispatch deadline
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Outbound call handed to an agent backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCall {
    pub agent: AgentId,
    pub context_id: ContextId,
    pub role: AgentRole,
    pub depth: u32,
    /// Fully assembled prompt
    pub message: String,
    /// Passed through to the backend untouched
    pub model_spec: Option<serde_json::Value>,
}

/// Agent's request to hand part of its work to a sub-team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecursionRequest {
    pub query: String,
    #[serde(default)]
    pub team_size: Option<usize>,
    #[serde(default)]
    pub formation_strategy: Option<FormationStrategy>,
}

impl RecursionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            team_size: None,
            formation_strategy: None,
        }
    }

    pub fn with_team_size(mut self, team_size: usize) -> Self {
        self.team_size = Some(team_size);
        self
    }
}

/// How the callee ended its turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum ResponseStatus {
    #[default]
    Complete,
    /// Callee needs more input before it can finish
    InputRequired(String),
    /// Callee needs authorization before it can finish
    AuthRequired(String),
}

/// Successful return of an agent call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub response_text: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub recursion_request: Option<RecursionRequest>,
    #[serde(default)]
    pub status: ResponseStatus,
}

impl AgentResponse {
    pub fn text(response_text: impl Into<String>) -> Self {
        Self {
            response_text: response_text.into(),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_recursion(mut self, request: RecursionRequest) -> Self {
        self.recursion_request = Some(request);
        self
    }

    pub fn input_required(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::InputRequired(message.into()),
            ..Default::default()
        }
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::AuthRequired(message.into()),
            ..Default::default()
        }
    }
}

/// Something that can answer an agent call
///
/// Implemented by in-process agents for direct execution and by protocol
/// clients for A2A execution. Errors are reported as
/// [`TroupeError::AgentError`] and surface verbatim on the task.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(&self, call: &AgentCall) -> Result<AgentResponse>;
}

/// Per-dispatch settings
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub strategy: ExecutionStrategy,
    pub timeout: Duration,
    pub model_spec: Option<serde_json::Value>,
    pub role: AgentRole,
    pub depth: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::Direct,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
            model_spec: None,
            role: AgentRole::Solo,
            depth: 0,
        }
    }
}

/// What one dispatch produced
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Snapshot of the task once the call settled, terminal or paused
    pub task: Task,
    pub response_text: Option<String>,
    /// Only present when the call completed
    pub recursion_request: Option<RecursionRequest>,
}

enum CallEnd {
    Returned(Result<AgentResponse>),
    TimedOut,
    Cancelled,
}

/// Routes calls to the backend for each execution strategy
#[derive(Clone, Default)]
pub struct Dispatcher {
    direct: Option<Arc<dyn AgentBackend>>,
    a2a: Option<Arc<dyn AgentBackend>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend for in-process execution
    pub fn with_direct(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.direct = Some(backend);
        self
    }

    /// Protocol client for remote execution
    pub fn with_a2a(mut self, client: Arc<dyn AgentBackend>) -> Self {
        self.a2a = Some(client);
        self
    }

    pub fn supports(&self, strategy: ExecutionStrategy) -> bool {
        self.backend(strategy).is_some()
    }

    fn backend(&self, strategy: ExecutionStrategy) -> Option<&Arc<dyn AgentBackend>> {
        match strategy {
            ExecutionStrategy::Direct => self.direct.as_ref(),
            ExecutionStrategy::A2a => self.a2a.as_ref(),
        }
    }

    /// Run one call to completion, timeout or cancellation
    ///
    /// Never fails: every way the call can end is recorded on the tracker.
    /// A timed-out or cancelled call is dropped in flight. The tracker may
    /// start out submitted or paused; a paused tracker is resumed.
    #[instrument(skip_all, fields(agent = %prompt.agent_identifier, task_id = %tracker.task_id()))]
    pub async fn dispatch(
        &self,
        tracker: &mut TaskTracker,
        prompt: &ContextualPrompt,
        options: &DispatchOptions,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let agent = prompt.agent_identifier.clone();

        if cancel.is_cancelled() {
            report_misuse(tracker.cancel("cancelled before dispatch"));
            return DispatchOutcome::settled(tracker);
        }

        report_misuse(tracker.transition(TaskState::Working, None));

        let Some(backend) = self.backend(options.strategy) else {
            let err = TroupeError::AgentError(format!(
                "no backend configured for {} execution",
                options.strategy
            ));
            warn!(agent = %agent, strategy = %options.strategy, "Dispatch without backend");
            report_misuse(tracker.fail(TaskError::from(&err)));
            return DispatchOutcome::settled(tracker);
        };

        let call = AgentCall {
            agent: agent.clone(),
            context_id: tracker.context_id(),
            role: options.role,
            depth: options.depth,
            message: prompt.assemble(),
            model_spec: options.model_spec.clone(),
        };

        debug!(agent = %agent, strategy = %options.strategy, timeout = ?options.timeout, "Invoking agent");

        // A panicking backend fails only its own task
        let invocation = AssertUnwindSafe(backend.invoke(&call))
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|_| Err(TroupeError::AgentError("agent panicked".into()))));

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => CallEnd::Cancelled,
            returned = tokio::time::timeout(options.timeout, invocation) => match returned {
                Ok(result) => CallEnd::Returned(result),
                Err(_) => CallEnd::TimedOut,
            },
        };

        match end {
            CallEnd::Returned(Ok(response)) => Self::settle_response(tracker, &agent, response),
            CallEnd::Returned(Err(err)) => {
                warn!(agent = %agent, error = %err, "Agent call failed");
                report_misuse(tracker.fail(TaskError::from(&err)));
                DispatchOutcome::settled(tracker)
            }
            CallEnd::TimedOut => {
                let err = TroupeError::Timeout(options.timeout);
                warn!(agent = %agent, timeout = ?options.timeout, "Agent call timed out");
                report_misuse(tracker.fail(TaskError::from(&err)));
                DispatchOutcome::settled(tracker)
            }
            CallEnd::Cancelled => {
                info!(agent = %agent, "Agent call cancelled");
                report_misuse(tracker.cancel("cancelled during dispatch"));
                DispatchOutcome::settled(tracker)
            }
        }
    }

    fn settle_response(
        tracker: &mut TaskTracker,
        agent: &AgentId,
        response: AgentResponse,
    ) -> DispatchOutcome {
        for artifact in response.artifacts {
            report_misuse(tracker.add_artifact(artifact));
        }
        if !response.response_text.trim().is_empty() {
            let artifact = Artifact::text(format!("{agent}_response"), &response.response_text)
                .with_description(format!("Response from {agent}"));
            report_misuse(tracker.add_artifact(artifact));
        }

        let response_text = Some(response.response_text).filter(|t| !t.is_empty());

        let recursion_request = match response.status {
            ResponseStatus::Complete => {
                report_misuse(tracker.transition(TaskState::Completed, None));
                response.recursion_request
            }
            ResponseStatus::InputRequired(message) => {
                info!(agent = %agent, "Agent needs input");
                report_misuse(tracker.transition(TaskState::InputRequired, Some(message)));
                None
            }
            ResponseStatus::AuthRequired(message) => {
                info!(agent = %agent, "Agent needs authorization");
                report_misuse(tracker.transition(TaskState::AuthRequired, Some(message)));
                None
            }
        };

        DispatchOutcome {
            task: tracker.snapshot(),
            response_text,
            recursion_request,
        }
    }
}

impl DispatchOutcome {
    fn settled(tracker: &TaskTracker) -> Self {
        Self {
            task: tracker.snapshot(),
            response_text: None,
            recursion_request: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskErrorKind;
    use crate::stream::StreamPublisher;

    struct Echo;

    #[async_trait]
    impl AgentBackend for Echo {
        async fn invoke(&self, call: &AgentCall) -> Result<AgentResponse> {
            Ok(AgentResponse::text(format!("echo: {}", call.message)))
        }
    }

    struct Failing;

    #[async_trait]
    impl AgentBackend for Failing {
        async fn invoke(&self, _call: &AgentCall) -> Result<AgentResponse> {
            Err(TroupeError::AgentError("model overloaded".into()))
        }
    }

    struct Stalled;

    #[async_trait]
    impl AgentBackend for Stalled {
        async fn invoke(&self, _call: &AgentCall) -> Result<AgentResponse> {
            std::future::pending().await
        }
    }

    struct Panicking;

    #[async_trait]
    impl AgentBackend for Panicking {
        async fn invoke(&self, _call: &AgentCall) -> Result<AgentResponse> {
            panic!("backend bug")
        }
    }

    struct Scripted(AgentResponse);

    #[async_trait]
    impl AgentBackend for Scripted {
        async fn invoke(&self, _call: &AgentCall) -> Result<AgentResponse> {
            Ok(self.0.clone())
        }
    }

    fn setup() -> (TaskTracker, ContextualPrompt) {
        let publisher = StreamPublisher::default();
        let agent = AgentId::from("analyst");
        let tracker = TaskTracker::member(ContextId::new(), agent.clone(), publisher);
        let prompt = ContextualPrompt::new(agent, "Summarize the report");
        (tracker, prompt)
    }

    #[tokio::test]
    async fn test_direct_dispatch_completes() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Echo));
        let (mut tracker, prompt) = setup();

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.task.state, TaskState::Completed);
        assert_eq!(
            outcome.response_text.as_deref(),
            Some("echo: Summarize the report")
        );
        assert_eq!(outcome.task.artifacts.len(), 1);
        assert_eq!(outcome.task.artifacts[0].name, "analyst_response");
        assert!(outcome.task.history_is_valid());
    }

    #[tokio::test]
    async fn test_agent_error_is_verbatim() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Failing));
        let (mut tracker, prompt) = setup();

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.task.state, TaskState::Failed);
        let error = outcome.task.error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::AgentError);
        assert_eq!(error.message, "model overloaded");
    }

    #[tokio::test]
    async fn test_panicking_backend_fails_its_task() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Panicking));
        let (mut tracker, prompt) = setup();

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.task.state, TaskState::Failed);
        assert_eq!(outcome.task.error.unwrap().message, "agent panicked");
        assert_eq!(tracker.state(), TaskState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_task() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Stalled));
        let (mut tracker, prompt) = setup();
        let options = DispatchOptions {
            timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &options, &CancellationToken::new())
            .await;

        assert_eq!(outcome.task.state, TaskState::Failed);
        assert_eq!(outcome.task.error.unwrap().kind, TaskErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation_during_call() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Stalled));
        let (mut tracker, prompt) = setup();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &cancel)
            .await;

        assert_eq!(outcome.task.state, TaskState::Cancelled);
        assert_eq!(outcome.task.error.unwrap().kind, TaskErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_works() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Echo));
        let (mut tracker, prompt) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &cancel)
            .await;

        let states: Vec<TaskState> = outcome.task.history.iter().map(|t| t.state).collect();
        assert_eq!(states, vec![TaskState::Submitted, TaskState::Cancelled]);
    }

    #[tokio::test]
    async fn test_missing_backend_is_agent_error() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Echo));
        let (mut tracker, prompt) = setup();
        let options = DispatchOptions {
            strategy: ExecutionStrategy::A2a,
            ..Default::default()
        };

        assert!(!dispatcher.supports(ExecutionStrategy::A2a));
        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &options, &CancellationToken::new())
            .await;

        assert_eq!(outcome.task.state, TaskState::Failed);
        assert!(outcome.task.error.unwrap().message.contains("a2a"));
    }

    #[tokio::test]
    async fn test_input_required_is_surfaced() {
        let backend = Scripted(AgentResponse::input_required("Which quarter?"));
        let dispatcher = Dispatcher::new().with_direct(Arc::new(backend));
        let (mut tracker, prompt) = setup();

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.task.state, TaskState::InputRequired);
        assert!(outcome.task.error.is_none());
        assert_eq!(
            outcome.task.history.last().unwrap().message.as_deref(),
            Some("Which quarter?")
        );
    }

    #[tokio::test]
    async fn test_paused_tracker_is_resumed() {
        let dispatcher = Dispatcher::new().with_direct(Arc::new(Echo));
        let (mut tracker, prompt) = setup();
        tracker.transition(TaskState::Working, None).unwrap();
        tracker
            .transition(TaskState::InputRequired, Some("Which quarter?".into()))
            .unwrap();

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &CancellationToken::new())
            .await;

        let states: Vec<TaskState> = outcome.task.history.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                TaskState::Submitted,
                TaskState::Working,
                TaskState::InputRequired,
                TaskState::Working,
                TaskState::Completed,
            ]
        );
        assert!(outcome.task.history_is_valid());
    }

    #[tokio::test]
    async fn test_auth_required_is_surfaced() {
        let backend = Scripted(AgentResponse::auth_required("token expired"));
        let dispatcher = Dispatcher::new().with_a2a(Arc::new(backend));
        let (mut tracker, prompt) = setup();
        let options = DispatchOptions {
            strategy: ExecutionStrategy::A2a,
            ..Default::default()
        };

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &options, &CancellationToken::new())
            .await;

        assert_eq!(outcome.task.state, TaskState::AuthRequired);
    }

    #[tokio::test]
    async fn test_recursion_request_passed_back() {
        let backend = Scripted(
            AgentResponse::text("splitting the work")
                .with_recursion(RecursionRequest::new("Research pricing").with_team_size(2)),
        );
        let dispatcher = Dispatcher::new().with_direct(Arc::new(backend));
        let (mut tracker, prompt) = setup();

        let outcome = dispatcher
            .dispatch(&mut tracker, &prompt, &DispatchOptions::default(), &CancellationToken::new())
            .await;

        let request = outcome.recursion_request.unwrap();
        assert_eq!(request.query, "Research pricing");
        assert_eq!(request.team_size, Some(2));
    }
}
