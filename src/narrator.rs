//! Narrator synthesis - one agent folds a team's answers into a single one

use serde::{Deserialize, Serialize};

use crate::orchestrator::MemberResult;
use crate::task::Task;
use crate::types::AgentId;

/// Which agent synthesizes a team's answers, and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarratorConfig {
    pub agent: AgentId,
    /// Extra guidance appended to the synthesis query
    #[serde(default)]
    pub instructions: Option<String>,
}

impl NarratorConfig {
    pub fn new(agent: impl Into<AgentId>) -> Self {
        Self {
            agent: agent.into(),
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// The narrator's dispatch and what it answered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub agent: AgentId,
    pub task: Task,
    pub response_text: Option<String>,
}

/// Member answers as titled sections in team order
///
/// Members without an answer are skipped.
pub fn aggregate_responses(members: &[MemberResult]) -> String {
    members
        .iter()
        .filter_map(|member| {
            let text = member.response_text.as_deref()?.trim();
            if text.is_empty() {
                return None;
            }
            Some(format!(
                "### {} {}: {}\n{}",
                member.role,
                member.agent_index + 1,
                member.agent,
                text
            ))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Query handed to the narrator
pub fn narrative_query(base_query: &str, aggregated: &str, instructions: Option<&str>) -> String {
    let mut query = format!(
        "Original request:\n{base_query}\n\nTeam responses:\n\n{aggregated}"
    );
    if let Some(instructions) = instructions.filter(|i| !i.trim().is_empty()) {
        query.push_str("\n\n");
        query.push_str(instructions);
    }
    query
}
