//! Shared vocabulary for the orchestration core
//!
//! Identifiers, roles and strategy enums used by every other module. All types
//! serialize so results and stream events can be emitted as JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one node in the recursion tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

impl From<Uuid> for ContextId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for ContextId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("ctx-").unwrap_or(s);
        Uuid::parse_str(raw).map(Self)
    }
}

/// Identifier of one tracked unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identifier of an agent as known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Role an agent plays within its team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// May delegate to a sub-team
    Leader,
    /// Executes directly
    #[default]
    Follower,
    /// Works alone, no team formed
    Solo,
    /// Combines the team's answers into one
    Narrator,
}

impl AgentRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, AgentRole::Leader)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentRole::Leader => "leader",
            AgentRole::Follower => "follower",
            AgentRole::Solo => "solo",
            AgentRole::Narrator => "narrator",
        };
        f.write_str(s)
    }
}

/// How an agent is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// In-process call through the direct [`crate::dispatch::AgentBackend`]
    #[default]
    Direct,
    /// Networked call through a protocol client
    A2a,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::Direct => f.write_str("direct"),
            ExecutionStrategy::A2a => f.write_str("a2a"),
        }
    }
}

/// Policy for picking team members out of a candidate pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FormationStrategy {
    /// Uniform sampling without replacement
    #[default]
    Random,
    /// Members share a grouping key, sampled randomly within the group
    Homogenous,
}

impl fmt::Display for FormationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormationStrategy::Random => f.write_str("random"),
            FormationStrategy::Homogenous => f.write_str("homogenous"),
        }
    }
}

/// Candidate agent as supplied by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    /// Grouping key used by homogenous formation
    #[serde(default)]
    pub specialty: Option<String>,
    /// Declared leadership score in `[0, 1]`
    #[serde(default)]
    pub leadership_score: Option<f64>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: AgentId::new(id),
            specialty: None,
            leadership_score: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn with_leadership_score(mut self, score: f64) -> Self {
        self.leadership_score = Some(score);
        self
    }
}

/// Opaque result payload produced by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub name: String,
    pub description: String,
    pub content: serde_json::Value,
    /// Agent and context that produced it, set once it leaves its task
    #[serde(default)]
    pub source: Option<ArtifactSource>,
}

/// Where an artifact came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSource {
    pub agent: AgentId,
    pub context_id: ContextId,
    pub depth: u32,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content: serde_json::Value) -> Self {
        let name = name.into();
        Self {
            artifact_id: format!("artifact-{}", &Uuid::new_v4().simple().to_string()[..12]),
            description: String::new(),
            name,
            content,
            source: None,
        }
    }

    /// Plain-text artifact
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, serde_json::Value::String(text.into()))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attribute to `source` unless already attributed deeper in the tree
    pub fn attributed(mut self, source: ArtifactSource) -> Self {
        if self.source.is_none() {
            self.source = Some(source);
        }
        self
    }
}
