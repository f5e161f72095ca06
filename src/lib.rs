//! # Troupe
//!
//! Recursive agent-team orchestration.
//!
//! A query is handed to a team of agents. Members run concurrently, and a
//! member may delegate part of its work to a sub-team one level deeper, up
//! to a fixed depth bound. Every unit of work is tracked as a task with a
//! validated lifecycle, and every transition is published to a per-context
//! event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       ORCHESTRATION SERVICE                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │  Validation  │  │Context Ledger│  │  Task Index  │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐      ┌──────────────────┐
//!                  │ ORCHESTRATOR (depth 0)│─────▶│ Stream Publisher │
//!                  │ form team → prompt →  │      └──────────────────┘
//!                  │ dispatch → roll up    │
//!                  └───────────┬───────────┘
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │   Leader    │     │  Follower   │     │  Follower   │
//!   │  (depth 0)  │     │  (depth 0)  │     │  (depth 0)  │
//!   └──────┬──────┘     └─────────────┘     └─────────────┘
//!          │ delegation request
//!          ▼
//!   ┌─────────────────────────┐
//!   │ Sub-team (depth 1)      │
//!   │ same loop, own context  │
//!   └─────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Context**: One node in the recursion tree, bounded by `max_depth`
//! - **Team**: Members sampled from a candidate pool, at most one leader
//! - **Task**: A unit of work with a validated state machine
//! - **Stream**: Ordered per-context events, replayed to late subscribers
//! - **Pause**: A task waiting for input, held until resumed or expired

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod narrator;
pub mod orchestrator;
pub mod paused;
pub mod prompt;
pub mod registry;
pub mod service;
pub mod stream;
pub mod task;
pub mod team;
pub mod telemetry;
pub mod types;

pub use config::{load_config, PartialConfig, TroupeConfig};
pub use context::{ContextLedger, ExecutionContext, RootOptions};
pub use dispatch::{
    AgentBackend, AgentCall, AgentResponse, DispatchOptions, DispatchOutcome, Dispatcher,
    RecursionRequest, ResponseStatus,
};
pub use error::{Result, TaskError, TaskErrorKind, TroupeError};
pub use narrator::{NarratorConfig, SynthesisResult};
pub use orchestrator::{
    ExecutionResult, MemberResult, Orchestrator, OrchestratorConfig, RollupPolicy, TeamRequest,
};
pub use paused::{PausedTask, PausedTasks};
pub use prompt::{assemble_prompt, ContextualPrompt, PromptOverride};
pub use registry::{CandidateCriteria, CandidateSource, StaticRegistry};
pub use service::{
    ExecutionRequest, HealthReport, OrchestrationService, ServiceHandle, StreamingExecution,
    TeamExecutionRequest,
};
pub use stream::{StreamEvent, StreamPublisher, Subscription};
pub use task::{Task, TaskKind, TaskState, TaskTracker, Transition};
pub use team::{form_team, FormationConfig, TeamMember, TeamPlan};
pub use types::{
    AgentId, AgentProfile, AgentRole, Artifact, ArtifactSource, ContextId, ExecutionStrategy,
    FormationStrategy, TaskId,
};
