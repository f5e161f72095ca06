//! Orchestration service - inbound request handling

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TroupeConfig;
use crate::context::{ContextLedger, ExecutionContext, RootOptions};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{Result, TroupeError};
use crate::narrator::NarratorConfig;
use crate::orchestrator::{ExecutionResult, Orchestrator, TeamRequest};
use crate::prompt::PromptOverride;
use crate::registry::{CandidateCriteria, CandidateSource};
use crate::stream::{StreamPublisher, Subscription};
use crate::task::Task;
use crate::team::FormationConfig;
use crate::types::{AgentProfile, ContextId, ExecutionStrategy, FormationStrategy, TaskId};

/// Inbound request to run a query through a team
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub query: String,
    /// Use this root context id instead of generating one
    #[serde(default)]
    pub context_id: Option<ContextId>,
    /// Caller-side parent the root hangs under
    #[serde(default)]
    pub parent_context_id: Option<ContextId>,
    #[serde(default)]
    pub min_depth: u32,
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub team_size: Option<usize>,
    /// Empty means ask the candidate source
    #[serde(default)]
    pub agents_pool: Vec<AgentProfile>,
    #[serde(default)]
    pub model_spec: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    /// Falls back to the configured narrator
    #[serde(default)]
    pub synthesis: Option<NarratorConfig>,
}

impl ExecutionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_team_size(mut self, team_size: usize) -> Self {
        self.team_size = Some(team_size);
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_agents(mut self, agents: Vec<AgentProfile>) -> Self {
        self.agents_pool = agents;
        self
    }

    pub fn with_context_id(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_parent_context_id(mut self, parent: ContextId) -> Self {
        self.parent_context_id = Some(parent);
        self
    }

    pub fn with_execution_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.execution_strategy = strategy;
        self
    }

    pub fn with_synthesis(mut self, narrator: NarratorConfig) -> Self {
        self.synthesis = Some(narrator);
        self
    }
}

/// Inbound request to run one team with per-member prompt overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamExecutionRequest {
    pub base_query: String,
    #[serde(default)]
    pub member_prompt_overrides: Vec<PromptOverride>,
    #[serde(default)]
    pub team_size: Option<usize>,
    #[serde(default)]
    pub formation_strategy: FormationStrategy,
    #[serde(default)]
    pub preferred_execution_strategy: ExecutionStrategy,
    /// Falls back to the configured formation settings
    #[serde(default)]
    pub formation_config: Option<FormationConfig>,
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub agents_pool: Vec<AgentProfile>,
    #[serde(default)]
    pub model_spec: Option<serde_json::Value>,
    /// Falls back to the configured narrator
    #[serde(default)]
    pub synthesis: Option<NarratorConfig>,
}

/// Execution running on its own task
pub struct StreamingExecution {
    pub context_id: ContextId,
    /// Subscribed before execution started, so nothing is missed
    pub subscription: Subscription,
    pub handle: JoinHandle<ExecutionResult>,
}

/// Service liveness summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub active_contexts: usize,
    pub contexts_issued: u64,
    pub direct_backend: bool,
    pub a2a_backend: bool,
    pub started_at: DateTime<Utc>,
}

struct Prepared {
    ctx: ExecutionContext,
    request: TeamRequest,
    candidates: Vec<AgentProfile>,
}

/// Keeps a root in the running set for as long as its run is alive
struct RunningGuard<'a> {
    running: &'a RwLock<HashMap<ContextId, CancellationToken>>,
    context_id: ContextId,
}

impl<'a> RunningGuard<'a> {
    fn register(
        running: &'a RwLock<HashMap<ContextId, CancellationToken>>,
        context_id: ContextId,
        cancel: CancellationToken,
    ) -> Self {
        running.write().insert(context_id, cancel);
        Self { running, context_id }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.write().remove(&self.context_id);
    }
}

/// Validates requests, runs them and keeps their tasks for status queries
pub struct OrchestrationService {
    orchestrator: Orchestrator,
    defaults: TroupeConfig,
    /// Root contexts in flight
    running: RwLock<HashMap<ContextId, CancellationToken>>,
    /// Finished tasks by the context they ran in
    tasks: RwLock<HashMap<ContextId, Vec<Task>>>,
    /// Finished roots, oldest first, evicted past `retain_executions`
    finished: Mutex<VecDeque<ContextId>>,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl OrchestrationService {
    pub fn new(orchestrator: Orchestrator, defaults: TroupeConfig) -> Self {
        Self {
            orchestrator,
            defaults,
            running: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Wire a service from configuration
    pub fn from_config(
        config: TroupeConfig,
        dispatcher: Dispatcher,
        candidate_source: Option<Arc<dyn CandidateSource>>,
    ) -> Self {
        let mut orchestrator = Orchestrator::new(
            Arc::new(ContextLedger::new()),
            StreamPublisher::new(config.stream_capacity),
            dispatcher,
            config.orchestrator_config(),
        );
        if let Some(source) = candidate_source {
            orchestrator = orchestrator.with_candidate_source(source);
        }
        Self::new(orchestrator, config)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run a query and wait for its result
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let prepared = self.prepare_execution(request).await?;
        Ok(self.run(prepared).await)
    }

    /// Run a team request and wait for its result
    pub async fn execute_team(&self, request: TeamExecutionRequest) -> Result<ExecutionResult> {
        let prepared = self.prepare_team(request).await?;
        Ok(self.run(prepared).await)
    }

    /// Cancel an execution and everything below it
    pub fn cancel(&self, context_id: &ContextId) -> bool {
        match self.running.read().get(context_id) {
            Some(token) => {
                info!(context_id = %context_id, "Cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every execution in flight
    pub fn shutdown(&self) {
        info!(active = self.running.read().len(), "Shutting down orchestration service");
        self.shutdown.cancel();
    }

    /// Answer a task that paused for input or authorization
    pub async fn resume(&self, task_id: &TaskId, input: &str) -> Result<DispatchOutcome> {
        let outcome = self.orchestrator.resume(task_id, input).await?;
        self.update_task(&outcome.task);
        Ok(outcome)
    }

    /// Cancel a paused task without answering it
    pub fn cancel_task(&self, task_id: &TaskId) -> Result<Task> {
        let paused = self.orchestrator.paused_tasks();
        if !paused.waiting().contains(task_id) {
            return Err(TroupeError::NotPaused(*task_id));
        }
        let task = paused
            .settle(task_id, "cancelled by caller")
            .ok_or(TroupeError::NotPaused(*task_id))?;
        self.update_task(&task);
        Ok(task)
    }

    /// Root contexts currently executing
    pub fn active_contexts(&self) -> Vec<ContextId> {
        self.running.read().keys().copied().collect()
    }

    /// Roots whose results are still retained, oldest first
    pub fn retained_executions(&self) -> Vec<ContextId> {
        self.finished.lock().iter().copied().collect()
    }

    /// Tasks recorded under `context_id`, with paused tasks at their latest state
    pub fn tasks(&self, context_id: &ContextId) -> Vec<Task> {
        let paused = self.orchestrator.paused_tasks();
        self.tasks
            .read()
            .get(context_id)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|t| {
                        if t.is_terminal() {
                            t.clone()
                        } else {
                            paused.snapshot(&t.task_id).unwrap_or_else(|| t.clone())
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up a task by id
    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        let recorded = self
            .tasks
            .read()
            .values()
            .flatten()
            .find(|t| &t.task_id == task_id)
            .cloned()?;
        if recorded.is_terminal() {
            return Some(recorded);
        }
        self.orchestrator
            .paused_tasks()
            .snapshot(task_id)
            .or(Some(recorded))
    }

    pub fn health(&self) -> HealthReport {
        let dispatcher = self.orchestrator.dispatcher();
        let direct_backend = dispatcher.supports(ExecutionStrategy::Direct);
        let a2a_backend = dispatcher.supports(ExecutionStrategy::A2a);

        HealthReport {
            healthy: (direct_backend || a2a_backend) && !self.shutdown.is_cancelled(),
            active_contexts: self.running.read().len(),
            contexts_issued: self.orchestrator.ledger().issued(),
            direct_backend,
            a2a_backend,
            started_at: self.started_at,
        }
    }

    async fn prepare_execution(&self, request: ExecutionRequest) -> Result<Prepared> {
        if request.query.trim().is_empty() {
            return Err(TroupeError::InvalidRequest("query must not be empty".into()));
        }
        let max_depth = request.max_depth.unwrap_or(self.defaults.max_depth);
        let team_size = request.team_size.unwrap_or(self.defaults.team_size);
        validate_shape(request.min_depth, max_depth, team_size)?;

        let criteria = CandidateCriteria {
            query: request.query.clone(),
            specialty: None,
            limit: None,
        };
        let candidates = self
            .orchestrator
            .resolve_candidates(request.agents_pool, &criteria)
            .await?;

        let ctx = self.orchestrator.ledger().new_root_with(
            RootOptions {
                context_id: request.context_id,
                parent_context_id: request.parent_context_id,
            },
            max_depth,
            team_size,
        )?;

        let mut team_request = TeamRequest::new(request.query)
            .with_execution_strategy(request.execution_strategy)
            .with_formation_config(self.orchestrator.config().formation.clone());
        team_request.model_spec = request.model_spec;
        team_request.synthesis = request
            .synthesis
            .or_else(|| self.orchestrator.config().synthesis.clone());

        debug!(
            context_id = %ctx.context_id,
            min_depth = request.min_depth,
            max_depth,
            team_size,
            candidates = candidates.len(),
            "Prepared execution"
        );

        Ok(Prepared {
            ctx,
            request: team_request,
            candidates,
        })
    }

    async fn prepare_team(&self, request: TeamExecutionRequest) -> Result<Prepared> {
        if request.base_query.trim().is_empty() {
            return Err(TroupeError::InvalidRequest("base_query must not be empty".into()));
        }
        let max_depth = request.max_depth.unwrap_or(self.defaults.max_depth);
        let team_size = request.team_size.unwrap_or(self.defaults.team_size);
        validate_shape(0, max_depth, team_size)?;
        if request.member_prompt_overrides.len() > team_size {
            return Err(TroupeError::InvalidRequest(format!(
                "{} prompt overrides for a team of {}",
                request.member_prompt_overrides.len(),
                team_size
            )));
        }

        let formation_config = request
            .formation_config
            .unwrap_or_else(|| self.orchestrator.config().formation.clone());

        let criteria = CandidateCriteria {
            query: request.base_query.clone(),
            specialty: match request.formation_strategy {
                FormationStrategy::Homogenous => formation_config.grouping_key.clone(),
                FormationStrategy::Random => None,
            },
            limit: None,
        };
        let candidates = self
            .orchestrator
            .resolve_candidates(request.agents_pool, &criteria)
            .await?;

        let ctx = self.orchestrator.ledger().new_root(max_depth, team_size);

        let mut team_request = TeamRequest::new(request.base_query)
            .with_overrides(request.member_prompt_overrides)
            .with_formation_strategy(request.formation_strategy)
            .with_execution_strategy(request.preferred_execution_strategy)
            .with_formation_config(formation_config);
        team_request.model_spec = request.model_spec;
        team_request.synthesis = request
            .synthesis
            .or_else(|| self.orchestrator.config().synthesis.clone());

        Ok(Prepared {
            ctx,
            request: team_request,
            candidates,
        })
    }

    async fn run(&self, prepared: Prepared) -> ExecutionResult {
        let Prepared {
            ctx,
            request,
            candidates,
        } = prepared;

        let cancel = self.shutdown.child_token();
        // Removed on every exit, including a dropped caller
        let running = RunningGuard::register(&self.running, ctx.context_id, cancel.clone());

        info!(
            context_id = %ctx.context_id,
            max_depth = ctx.max_depth,
            team_size = ctx.team_size,
            "Execution started"
        );

        let result = self
            .orchestrator
            .execute_team(request, &ctx, &candidates, &cancel)
            .await;

        drop(running);
        self.record(&result);
        self.retain(ctx.context_id);

        if !result.is_completed() {
            warn!(
                context_id = %ctx.context_id,
                final_state = %result.final_state,
                "Execution did not complete"
            );
        }
        result
    }

    fn record(&self, result: &ExecutionResult) {
        let mut tasks = self.tasks.write();
        for task in result.all_tasks() {
            tasks.entry(task.context_id).or_default().push(task.clone());
        }
    }

    fn update_task(&self, task: &Task) {
        let mut tasks = self.tasks.write();
        if let Some(recorded) = tasks
            .get_mut(&task.context_id)
            .and_then(|list| list.iter_mut().find(|t| t.task_id == task.task_id))
        {
            *recorded = task.clone();
        }
    }

    /// Remember `root` as finished and evict the oldest roots past the limit
    fn retain(&self, root: ContextId) {
        let evicted: Vec<ContextId> = {
            let mut finished = self.finished.lock();
            finished.push_back(root);
            let excess = finished.len().saturating_sub(self.defaults.retain_executions);
            finished.drain(..excess).collect()
        };

        for old in evicted {
            let contexts = self.orchestrator.forget_tree(&old);
            let mut tasks = self.tasks.write();
            for context_id in &contexts {
                tasks.remove(context_id);
            }
            debug!(root = %old, contexts = contexts.len(), "Evicted finished execution");
        }
    }
}

fn validate_shape(min_depth: u32, max_depth: u32, team_size: usize) -> Result<()> {
    if min_depth > max_depth {
        return Err(TroupeError::InvalidRequest(format!(
            "min_depth {min_depth} exceeds max_depth {max_depth}"
        )));
    }
    if team_size == 0 {
        return Err(TroupeError::InvalidRequest("team_size must be at least 1".into()));
    }
    Ok(())
}

/// Cloneable handle to a service
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<OrchestrationService>,
}

impl ServiceHandle {
    pub fn new(service: OrchestrationService) -> Self {
        Self {
            inner: Arc::new(service),
        }
    }

    /// Start an execution on a spawned task and follow its root stream
    pub async fn execute_streaming(&self, request: ExecutionRequest) -> Result<StreamingExecution> {
        let prepared = self.prepare_execution(request).await?;
        let context_id = prepared.ctx.context_id;
        let subscription = self.orchestrator.publisher().subscribe(context_id);

        let service = self.clone();
        let handle = tokio::spawn(async move { service.run(prepared).await });

        Ok(StreamingExecution {
            context_id,
            subscription,
            handle,
        })
    }
}

impl Deref for ServiceHandle {
    type Target = OrchestrationService;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
