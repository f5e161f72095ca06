//! Recursive orchestrator - forms a team, dispatches it and rolls up the result
//!
//! Each call handles one node of the recursion tree. Members run as their own
//! tokio tasks; a member that asks for delegation gets a child context and a
//! nested call whose result is stored inside that member's result. Members
//! that pause for input are parked until resumed, cancelled or expired.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::context::{ContextLedger, ExecutionContext};
use crate::dispatch::{
    DispatchOptions, DispatchOutcome, Dispatcher, RecursionRequest, DEFAULT_DISPATCH_TIMEOUT,
};
use crate::error::{Result, TaskError, TaskErrorKind, TroupeError};
use crate::narrator::{aggregate_responses, narrative_query, NarratorConfig, SynthesisResult};
use crate::paused::{PausedTask, PausedTasks, DEFAULT_PAUSE_TIMEOUT};
use crate::prompt::{prompt_for_member, PromptOverride};
use crate::registry::{CandidateCriteria, CandidateSource};
use crate::stream::StreamPublisher;
use crate::task::{report_misuse, Task, TaskState, TaskTracker};
use crate::team::{form_team, FormationConfig, TeamMember, TeamPlan};
use crate::types::{
    AgentId, AgentProfile, AgentRole, Artifact, ArtifactSource, ContextId, ExecutionStrategy,
    FormationStrategy, TaskId,
};

/// How member outcomes combine into the team outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollupPolicy {
    /// Completed unless every settled member failed
    #[default]
    Permissive,
    /// Any member that did not complete fails the team
    Strict,
}

impl fmt::Display for RollupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollupPolicy::Permissive => f.write_str("permissive"),
            RollupPolicy::Strict => f.write_str("strict"),
        }
    }
}

/// Orchestrator-wide settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for each individual agent call
    pub dispatch_timeout: Duration,
    pub rollup_policy: RollupPolicy,
    /// Formation settings used when a request does not bring its own
    pub formation: FormationConfig,
    /// How long a task may wait for input before it fails
    pub pause_timeout: Duration,
    /// Narrator used by [`Orchestrator::execute`]
    pub synthesis: Option<NarratorConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            rollup_policy: RollupPolicy::default(),
            formation: FormationConfig::default(),
            pause_timeout: DEFAULT_PAUSE_TIMEOUT,
            synthesis: None,
        }
    }
}

/// One team's work order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRequest {
    pub base_query: String,
    /// Index-aligned with the formed team; missing entries keep the role framing
    #[serde(default)]
    pub member_prompt_overrides: Vec<PromptOverride>,
    #[serde(default)]
    pub formation_strategy: FormationStrategy,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default)]
    pub formation_config: FormationConfig,
    /// Passed through to every agent call
    #[serde(default)]
    pub model_spec: Option<serde_json::Value>,
    /// Narrator that folds this team's answers into one
    #[serde(default)]
    pub synthesis: Option<NarratorConfig>,
}

impl TeamRequest {
    pub fn new(base_query: impl Into<String>) -> Self {
        Self {
            base_query: base_query.into(),
            member_prompt_overrides: Vec::new(),
            formation_strategy: FormationStrategy::default(),
            execution_strategy: ExecutionStrategy::default(),
            formation_config: FormationConfig::default(),
            model_spec: None,
            synthesis: None,
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<PromptOverride>) -> Self {
        self.member_prompt_overrides = overrides;
        self
    }

    pub fn with_formation_strategy(mut self, strategy: FormationStrategy) -> Self {
        self.formation_strategy = strategy;
        self
    }

    pub fn with_execution_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.execution_strategy = strategy;
        self
    }

    pub fn with_formation_config(mut self, config: FormationConfig) -> Self {
        self.formation_config = config;
        self
    }

    pub fn with_model_spec(mut self, model_spec: serde_json::Value) -> Self {
        self.model_spec = Some(model_spec);
        self
    }

    pub fn with_synthesis(mut self, narrator: NarratorConfig) -> Self {
        self.synthesis = Some(narrator);
        self
    }

    /// Work order for a sub-team spawned by one member
    ///
    /// Sub-teams answer to the delegating member, so they are never narrated.
    fn delegate(&self, request: RecursionRequest) -> Self {
        let mut formation_config = self.formation_config.clone();
        formation_config.designated_leader = None;

        Self {
            base_query: request.query,
            member_prompt_overrides: Vec::new(),
            formation_strategy: request
                .formation_strategy
                .unwrap_or(self.formation_strategy),
            execution_strategy: self.execution_strategy,
            formation_config,
            model_spec: self.model_spec.clone(),
            synthesis: None,
        }
    }
}

/// Outcome of one dispatched team member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberResult {
    pub agent: AgentId,
    pub role: AgentRole,
    pub agent_index: usize,
    /// The member's own call
    pub task: Task,
    pub response_text: Option<String>,
    /// Sub-team the member delegated to
    pub nested: Option<Box<ExecutionResult>>,
}

impl MemberResult {
    /// State used for rollup, including the member's sub-team
    pub fn effective_state(&self) -> TaskState {
        match (&self.nested, self.task.state) {
            (Some(nested), TaskState::Completed) => nested.final_state,
            (_, state) => state,
        }
    }

    /// Why the member did not complete, if it failed
    pub fn failure(&self) -> Option<&TaskError> {
        self.task
            .error
            .as_ref()
            .or_else(|| self.nested.as_ref().and_then(|n| n.error.as_ref()))
    }
}

/// Outcome of one node of the recursion tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub context_id: ContextId,
    pub final_state: TaskState,
    /// In team order
    pub member_results: Vec<MemberResult>,
    pub total_elapsed: Duration,
    /// Member artifacts in team order, then lifted sub-team artifacts, then
    /// the narrator's
    pub artifacts: Vec<Artifact>,
    /// Team-level task, or the refused delegation for a branch that asked to
    /// recurse past the depth bound
    pub coordination_task: Option<Task>,
    pub execution_strategy: ExecutionStrategy,
    pub recursion_depth: u32,
    /// Set whenever the node did not complete
    pub error: Option<TaskError>,
    /// Narrator pass over the members' answers
    #[serde(default)]
    pub synthesis: Option<SynthesisResult>,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.final_state == TaskState::Completed
    }

    /// Every task in this subtree, coordination tasks included
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.coordination_task.iter().collect();
        for member in &self.member_results {
            tasks.push(&member.task);
            if let Some(nested) = &member.nested {
                tasks.extend(nested.all_tasks());
            }
        }
        tasks.extend(self.synthesis.iter().map(|s| &s.task));
        tasks
    }

    /// Deepest node reached below and including this one
    pub fn max_depth_reached(&self) -> u32 {
        self.member_results
            .iter()
            .filter_map(|m| m.nested.as_ref())
            .map(|n| n.max_depth_reached())
            .fold(self.recursion_depth, u32::max)
    }

    /// The narrator's answer, or the first member answer without one
    pub fn final_response(&self) -> Option<&str> {
        self.synthesis
            .as_ref()
            .and_then(|s| s.response_text.as_deref())
            .or_else(|| {
                self.member_results
                    .iter()
                    .find_map(|m| m.response_text.as_deref())
            })
    }

    fn aborted(
        ctx: &ExecutionContext,
        strategy: ExecutionStrategy,
        coordination: Task,
        started: Instant,
    ) -> Self {
        Self {
            context_id: ctx.context_id,
            final_state: coordination.state,
            member_results: Vec::new(),
            total_elapsed: started.elapsed(),
            artifacts: Vec::new(),
            error: coordination.error.clone(),
            coordination_task: Some(coordination),
            execution_strategy: strategy,
            recursion_depth: ctx.depth,
            synthesis: None,
        }
    }

    /// Branch that asked to recurse past the depth bound
    ///
    /// No child context exists, so the result reports the parent's.
    fn depth_exceeded(parent: &ExecutionContext, strategy: ExecutionStrategy, delegation: Task) -> Self {
        Self {
            context_id: parent.context_id,
            final_state: delegation.state,
            member_results: Vec::new(),
            total_elapsed: Duration::ZERO,
            artifacts: Vec::new(),
            error: delegation.error.clone(),
            coordination_task: Some(delegation),
            execution_strategy: strategy,
            recursion_depth: parent.depth,
            synthesis: None,
        }
    }

    /// Cancel every task in this subtree still waiting for input
    fn settle_paused(&mut self, paused: &PausedTasks) {
        for member in &mut self.member_results {
            if member.task.state.is_paused() {
                if let Some(task) = paused.settle(&member.task.task_id, "cancelled while paused") {
                    member.task = task;
                }
            }
            if let Some(nested) = &mut member.nested {
                nested.settle_paused(paused);
            }
        }
        if let Some(synthesis) = &mut self.synthesis {
            if synthesis.task.state.is_paused() {
                if let Some(task) = paused.settle(&synthesis.task.task_id, "cancelled while paused") {
                    synthesis.task = task;
                }
            }
        }
    }
}

/// Combine member states into the team state
pub fn rollup(policy: RollupPolicy, states: &[TaskState], cancelled: bool) -> TaskState {
    if states.is_empty() {
        return TaskState::Failed;
    }

    let completed = states.iter().filter(|s| **s == TaskState::Completed).count();
    if completed == states.len() {
        return TaskState::Completed;
    }

    if cancelled && states.contains(&TaskState::Cancelled) {
        return TaskState::Cancelled;
    }

    match policy {
        RollupPolicy::Strict => TaskState::Failed,
        RollupPolicy::Permissive => {
            let failed = states
                .iter()
                .any(|s| matches!(s, TaskState::Failed | TaskState::Rejected));
            if completed == 0 && failed {
                TaskState::Failed
            } else {
                TaskState::Completed
            }
        }
    }
}

/// Drives teams through the recursion tree
///
/// Collaborators come in through the constructor; nothing is global. Clones
/// share every collaborator, so a clone can be moved into a spawned member.
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<ContextLedger>,
    publisher: StreamPublisher,
    dispatcher: Dispatcher,
    candidate_source: Option<Arc<dyn CandidateSource>>,
    paused: PausedTasks,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<ContextLedger>,
        publisher: StreamPublisher,
        dispatcher: Dispatcher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            publisher,
            dispatcher,
            candidate_source: None,
            paused: PausedTasks::new(),
            config: Arc::new(config),
        }
    }

    /// Source queried when a request arrives with an empty pool
    pub fn with_candidate_source(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.candidate_source = Some(source);
        self
    }

    pub fn ledger(&self) -> &Arc<ContextLedger> {
        &self.ledger
    }

    pub fn publisher(&self) -> &StreamPublisher {
        &self.publisher
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Tasks currently waiting for input or authorization
    pub fn paused_tasks(&self) -> &PausedTasks {
        &self.paused
    }

    /// Use `pool` as given, or ask the candidate source when it is empty
    pub async fn resolve_candidates(
        &self,
        pool: Vec<AgentProfile>,
        criteria: &CandidateCriteria,
    ) -> Result<Vec<AgentProfile>> {
        if !pool.is_empty() {
            return Ok(pool);
        }
        match &self.candidate_source {
            Some(source) => source.candidates(criteria).await,
            None => Ok(Vec::new()),
        }
    }

    /// Run `query` at `ctx` with the default formation and synthesis settings
    #[instrument(skip_all, fields(context_id = %ctx.context_id, depth = ctx.depth))]
    pub async fn execute(
        &self,
        query: &str,
        ctx: &ExecutionContext,
        candidates: &[AgentProfile],
        strategy: ExecutionStrategy,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let mut request = TeamRequest::new(query)
            .with_execution_strategy(strategy)
            .with_formation_config(self.config.formation.clone());
        request.synthesis = self.config.synthesis.clone();
        self.execute_team(request, ctx, candidates, cancel).await
    }

    /// Run a fully specified team request at `ctx`
    ///
    /// Cancelling `cancel` stops every dispatch in the subtree and cancels
    /// its paused tasks; nothing above `ctx` is affected. Dropping the
    /// returned future cancels the subtree as well.
    pub async fn execute_team(
        &self,
        request: TeamRequest,
        ctx: &ExecutionContext,
        candidates: &[AgentProfile],
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let candidates: Arc<[AgentProfile]> = candidates.into();
        self.run_node(Arc::new(request), ctx.clone(), candidates, cancel.child_token())
            .await
    }

    /// Dispatch a paused task again with the caller's answer
    ///
    /// A task that pauses once more is parked again. A delegation request in
    /// the answer is returned to the caller, not executed.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn resume(&self, task_id: &TaskId, input: &str) -> Result<DispatchOutcome> {
        let Some(PausedTask {
            mut tracker,
            prompt,
            options,
            cancel,
        }) = self.paused.take(task_id)
        else {
            return Err(TroupeError::NotPaused(*task_id));
        };

        let postfix = if prompt.postfix_context.is_empty() {
            format!("Additional input: {input}")
        } else {
            format!("{}\n\nAdditional input: {input}", prompt.postfix_context)
        };
        let prompt = prompt.with_postfix(postfix);

        info!(agent = %prompt.agent_identifier, "Resuming paused task");
        let outcome = self.dispatcher.dispatch(&mut tracker, &prompt, &options, &cancel).await;

        if outcome.recursion_request.is_some() {
            debug!("Resumed task asked for delegation; returned to caller");
        }

        if tracker.state().is_paused() {
            self.paused.park(
                PausedTask {
                    tracker,
                    prompt,
                    options,
                    cancel,
                },
                self.config.pause_timeout,
            );
        } else {
            self.paused.remember(tracker.into_task());
        }

        Ok(outcome)
    }

    /// Drop every record of the tree rooted at `root`
    ///
    /// Removes the ledger entries, the event logs and any paused tasks.
    /// Returns the contexts removed.
    pub fn forget_tree(&self, root: &ContextId) -> Vec<ContextId> {
        let mut removed = self.ledger.remove_tree(root);
        if removed.is_empty() {
            removed.push(*root);
        }
        for context_id in &removed {
            self.publisher.forget(context_id);
        }
        let tasks = self.paused.forget_contexts(&removed);
        debug!(root = %root, contexts = removed.len(), tasks, "Forgot execution tree");
        removed
    }

    fn run_node(
        &self,
        request: Arc<TeamRequest>,
        ctx: ExecutionContext,
        candidates: Arc<[AgentProfile]>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ExecutionResult> {
        let span = info_span!("team", context_id = %ctx.context_id, depth = ctx.depth);
        let this = self.clone();

        async move {
            // Members outlive a dropped node unless told to stop
            let guard = cancel.clone().drop_guard();
            let result = this.drive_team(&request, &ctx, &candidates, &cancel).await;
            guard.disarm();
            result
        }
        .instrument(span)
        .boxed()
    }

    async fn drive_team(
        &self,
        request: &Arc<TeamRequest>,
        ctx: &ExecutionContext,
        candidates: &Arc<[AgentProfile]>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let strategy = request.execution_strategy;
        let mut coordination = TaskTracker::coordination(ctx.context_id, self.publisher.clone());

        if cancel.is_cancelled() {
            report_misuse(coordination.cancel("cancelled before team formation"));
            return ExecutionResult::aborted(ctx, strategy, coordination.into_task(), started);
        }

        report_misuse(coordination.transition(TaskState::Working, Some("forming team".into())));

        let plan = match plan_team(request, ctx, candidates) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "Team formation failed");
                report_misuse(coordination.fail(TaskError::from(&err)));
                return ExecutionResult::aborted(ctx, strategy, coordination.into_task(), started);
            }
        };

        info!(
            members = plan.len(),
            strategy = %strategy,
            query = %request.base_query,
            "Dispatching team"
        );

        let handles: Vec<_> = plan
            .members
            .iter()
            .enumerate()
            .map(|(agent_index, member)| {
                let tracker =
                    TaskTracker::member(ctx.context_id, member.agent.clone(), self.publisher.clone());
                let this = self.clone();
                let request = Arc::clone(request);
                let ctx = ctx.clone();
                let candidates = Arc::clone(candidates);
                let member = member.clone();
                let cancel = cancel.clone();

                tokio::spawn(
                    async move {
                        this.run_member(&request, &ctx, &candidates, agent_index, &member, tracker, &cancel)
                            .await
                    }
                    .in_current_span(),
                )
            })
            .collect();

        let mut member_results = Vec::with_capacity(handles.len());
        let mut parked = Vec::new();
        for (agent_index, (joined, member)) in join_all(handles)
            .await
            .into_iter()
            .zip(&plan.members)
            .enumerate()
        {
            match joined {
                Ok((result, paused)) => {
                    member_results.push(result);
                    parked.extend(paused);
                }
                Err(err) => member_results.push(self.lost_member(ctx, agent_index, member, &err)),
            }
        }

        let mut synthesis = None;
        if cancel.is_cancelled() {
            for paused in parked {
                let mut tracker = paused.tracker;
                report_misuse(tracker.cancel("cancelled while paused"));
                let task = tracker.into_task();
                if let Some(member) = member_results.iter_mut().find(|m| m.task.task_id == task.task_id) {
                    member.task = task;
                }
            }
            for member in &mut member_results {
                if let Some(nested) = &mut member.nested {
                    nested.settle_paused(&self.paused);
                }
            }
        } else {
            if let Some((result, paused)) = self.synthesize(request, ctx, &member_results, cancel).await {
                parked.extend(paused);
                synthesis = Some(result);
            }
            for paused in parked {
                self.paused.park(paused, self.config.pause_timeout);
            }
        }

        let mut states: Vec<TaskState> = member_results.iter().map(MemberResult::effective_state).collect();
        states.extend(synthesis.iter().map(|s| s.task.state));
        let final_state = rollup(self.config.rollup_policy, &states, cancel.is_cancelled());
        let completed = member_results
            .iter()
            .filter(|m| m.effective_state() == TaskState::Completed)
            .count();
        let summary = format!("{completed}/{} members completed", member_results.len());

        match final_state {
            TaskState::Completed => {
                report_misuse(coordination.transition(TaskState::Completed, Some(summary)));
            }
            TaskState::Cancelled => report_misuse(coordination.cancel(summary)),
            _ => {
                let kind = member_results
                    .iter()
                    .find_map(MemberResult::failure)
                    .or_else(|| synthesis.as_ref().and_then(|s| s.task.error.as_ref()))
                    .map(|e| e.kind)
                    .unwrap_or(TaskErrorKind::AgentError);
                report_misuse(coordination.fail(TaskError::new(kind, summary)));
            }
        }

        let coordination = coordination.into_task();
        let artifacts = collect_artifacts(ctx, &member_results, synthesis.as_ref());
        let elapsed = started.elapsed();

        info!(
            final_state = %coordination.state,
            completed,
            members = member_results.len(),
            artifacts = artifacts.len(),
            synthesized = synthesis.is_some(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Team finished"
        );

        ExecutionResult {
            context_id: ctx.context_id,
            final_state: coordination.state,
            member_results,
            total_elapsed: elapsed,
            artifacts,
            error: coordination.error.clone(),
            coordination_task: Some(coordination),
            execution_strategy: strategy,
            recursion_depth: ctx.depth,
            synthesis,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_member(
        &self,
        request: &TeamRequest,
        ctx: &ExecutionContext,
        candidates: &Arc<[AgentProfile]>,
        agent_index: usize,
        member: &TeamMember,
        mut tracker: TaskTracker,
        cancel: &CancellationToken,
    ) -> (MemberResult, Option<PausedTask>) {
        let mut prompt = prompt_for_member(&member.agent, member.role, ctx, &request.base_query);
        if let Some(over) = request.member_prompt_overrides.get(agent_index) {
            prompt = prompt.apply_override(over);
        }

        let options = DispatchOptions {
            strategy: request.execution_strategy,
            timeout: self.config.dispatch_timeout,
            model_spec: request.model_spec.clone(),
            role: member.role,
            depth: ctx.depth,
        };

        let outcome = self.dispatcher.dispatch(&mut tracker, &prompt, &options, cancel).await;

        let nested = match outcome.recursion_request {
            Some(recursion) => Some(Box::new(
                self.delegate(request, ctx, candidates, agent_index, member, recursion, cancel)
                    .await,
            )),
            None => None,
        };

        let paused = tracker.state().is_paused().then(|| PausedTask {
            tracker,
            prompt,
            options,
            cancel: cancel.clone(),
        });

        let result = MemberResult {
            agent: member.agent.clone(),
            role: member.role,
            agent_index,
            task: outcome.task,
            response_text: outcome.response_text,
            nested,
        };
        (result, paused)
    }

    #[allow(clippy::too_many_arguments)]
    async fn delegate(
        &self,
        request: &TeamRequest,
        ctx: &ExecutionContext,
        candidates: &Arc<[AgentProfile]>,
        agent_index: usize,
        member: &TeamMember,
        recursion: RecursionRequest,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let team_size = recursion.team_size.unwrap_or(ctx.team_size);

        let child = match self.ledger.new_child(ctx, member.role, agent_index, team_size) {
            Ok(child) => child,
            Err(err) => {
                warn!(agent = %member.agent, error = %err, "Delegation refused");
                let mut delegation =
                    TaskTracker::delegation(ctx.context_id, member.agent.clone(), self.publisher.clone());
                report_misuse(delegation.transition(
                    TaskState::Working,
                    Some(format!("delegation requested: {}", recursion.query)),
                ));
                report_misuse(delegation.fail(TaskError::from(&err)));
                return ExecutionResult::depth_exceeded(
                    ctx,
                    request.execution_strategy,
                    delegation.into_task(),
                );
            }
        };

        info!(
            agent = %member.agent,
            child_context = %child.context_id,
            depth = child.depth,
            team_size,
            "Delegating to sub-team"
        );

        self.run_node(
            Arc::new(request.delegate(recursion)),
            child,
            Arc::clone(candidates),
            cancel.child_token(),
        )
        .await
    }

    /// Dispatch the narrator over the members' answers
    ///
    /// Skipped when no narrator is configured or no member answered.
    async fn synthesize(
        &self,
        request: &TeamRequest,
        ctx: &ExecutionContext,
        members: &[MemberResult],
        cancel: &CancellationToken,
    ) -> Option<(SynthesisResult, Option<PausedTask>)> {
        let narrator = request.synthesis.as_ref()?;

        let aggregated = aggregate_responses(members);
        if aggregated.is_empty() {
            debug!(agent = %narrator.agent, "No answers to synthesize");
            return None;
        }

        let query = narrative_query(&request.base_query, &aggregated, narrator.instructions.as_deref());
        let prompt = prompt_for_member(&narrator.agent, AgentRole::Narrator, ctx, &query);
        let options = DispatchOptions {
            strategy: request.execution_strategy,
            timeout: self.config.dispatch_timeout,
            model_spec: request.model_spec.clone(),
            role: AgentRole::Narrator,
            depth: ctx.depth,
        };

        info!(agent = %narrator.agent, "Synthesizing team answers");
        let mut tracker =
            TaskTracker::member(ctx.context_id, narrator.agent.clone(), self.publisher.clone());
        let outcome = self.dispatcher.dispatch(&mut tracker, &prompt, &options, cancel).await;

        if outcome.recursion_request.is_some() {
            debug!(agent = %narrator.agent, "Narrator may not delegate; request ignored");
        }

        let paused = tracker.state().is_paused().then(|| PausedTask {
            tracker,
            prompt,
            options,
            cancel: cancel.clone(),
        });

        let result = SynthesisResult {
            agent: narrator.agent.clone(),
            task: outcome.task,
            response_text: outcome.response_text,
        };
        Some((result, paused))
    }

    /// Stand-in result for a member whose task died before reporting
    fn lost_member(
        &self,
        ctx: &ExecutionContext,
        agent_index: usize,
        member: &TeamMember,
        err: &JoinError,
    ) -> MemberResult {
        error!(agent = %member.agent, agent_index, error = %err, "Member task aborted");

        let mut tracker = TaskTracker::member(ctx.context_id, member.agent.clone(), self.publisher.clone());
        report_misuse(tracker.transition(TaskState::Working, None));
        report_misuse(tracker.fail(TaskError::new(
            TaskErrorKind::AgentError,
            format!("member task aborted: {err}"),
        )));

        MemberResult {
            agent: member.agent.clone(),
            role: member.role,
            agent_index,
            task: tracker.into_task(),
            response_text: None,
            nested: None,
        }
    }
}

fn plan_team(
    request: &TeamRequest,
    ctx: &ExecutionContext,
    candidates: &[AgentProfile],
) -> Result<TeamPlan> {
    if ctx.team_size > 1 {
        return form_team(
            candidates,
            ctx,
            request.formation_strategy,
            &request.formation_config,
        );
    }

    // A single agent is dispatched directly, first preference wins
    let first = candidates
        .first()
        .ok_or(TroupeError::InsufficientCandidates {
            requested: 1,
            available: 0,
        })?;

    // Below the root a lone agent still answers to the delegating member
    let role = if ctx.is_root() {
        AgentRole::Solo
    } else {
        AgentRole::Follower
    };

    Ok(TeamPlan {
        members: vec![TeamMember {
            agent: first.id.clone(),
            role,
        }],
        formation_strategy: request.formation_strategy,
        formation_config: request.formation_config.clone(),
    })
}

fn collect_artifacts(
    ctx: &ExecutionContext,
    members: &[MemberResult],
    synthesis: Option<&SynthesisResult>,
) -> Vec<Artifact> {
    let mut seen = HashSet::new();
    let mut artifacts = Vec::new();

    let source = |agent: &AgentId| ArtifactSource {
        agent: agent.clone(),
        context_id: ctx.context_id,
        depth: ctx.depth,
    };

    for member in members {
        let origin = source(&member.agent);
        let own = member
            .task
            .artifacts
            .iter()
            .map(|a| a.clone().attributed(origin.clone()));
        let lifted = member
            .nested
            .iter()
            .flat_map(|n| n.artifacts.iter().cloned());

        for artifact in own.chain(lifted) {
            if seen.insert(artifact.artifact_id.clone()) {
                artifacts.push(artifact);
            }
        }
    }

    if let Some(synthesis) = synthesis {
        let origin = source(&synthesis.agent);
        for artifact in &synthesis.task.artifacts {
            if seen.insert(artifact.artifact_id.clone()) {
                artifacts.push(artifact.clone().attributed(origin.clone()));
            }
        }
    }

    artifacts
}
