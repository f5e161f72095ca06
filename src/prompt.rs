//! Prompt assembly - prefix, base query and postfix joined into one message

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::types::{AgentId, AgentRole};

const SECTION_SEPARATOR: &str = "\n\n";

/// Per-agent instruction packet
///
/// Built fresh for every dispatch and never shared between agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextualPrompt {
    pub agent_identifier: AgentId,
    pub prefix_context: String,
    pub postfix_context: String,
    pub base_query: String,
}

impl ContextualPrompt {
    pub fn new(agent_identifier: AgentId, base_query: impl Into<String>) -> Self {
        Self {
            agent_identifier,
            prefix_context: String::new(),
            postfix_context: String::new(),
            base_query: base_query.into(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix_context = prefix.into();
        self
    }

    pub fn with_postfix(mut self, postfix: impl Into<String>) -> Self {
        self.postfix_context = postfix.into();
        self
    }

    /// Replace whichever parts the override supplies
    pub fn apply_override(mut self, over: &PromptOverride) -> Self {
        if let Some(prefix) = &over.prefix {
            self.prefix_context = prefix.clone();
        }
        if let Some(postfix) = &over.postfix {
            self.postfix_context = postfix.clone();
        }
        self
    }

    /// The message sent to the agent
    pub fn assemble(&self) -> String {
        assemble_prompt(&self.prefix_context, &self.base_query, &self.postfix_context)
    }
}

/// Join the three parts, skipping empty ones
///
/// Pure: identical inputs always give byte-identical output.
pub fn assemble_prompt(prefix: &str, base_query: &str, postfix: &str) -> String {
    [prefix, base_query, postfix]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

/// Caller-supplied replacement of one member's framing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOverride {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub postfix: Option<String>,
}

/// Build the prompt for one team member, framed by its role
pub fn prompt_for_member(
    agent: &AgentId,
    role: AgentRole,
    ctx: &ExecutionContext,
    base_query: &str,
) -> ContextualPrompt {
    ContextualPrompt::new(agent.clone(), base_query)
        .with_prefix(role_prefix(role, ctx))
        .with_postfix(role_postfix(role))
}

fn role_prefix(role: AgentRole, ctx: &ExecutionContext) -> String {
    let position = format!(
        "Depth {}/{} · team of {}",
        ctx.depth, ctx.max_depth, ctx.team_size
    );

    match role {
        AgentRole::Leader if ctx.depth == 0 => format!(
            "## Strategic Leadership\n\
             You lead at the top level. Break the problem into parts and decide \
             which parts deserve a dedicated sub-team.\n{position}"
        ),
        AgentRole::Leader if ctx.depth + 2 <= ctx.max_depth => format!(
            "## Team Building & Delegation\n\
             You may assemble a sub-team for parts of this task. Request \
             delegation only when specialists or parallel work would help.\n\
             Recursion remaining: {}\n{position}",
            ctx.recursion_remaining()
        ),
        AgentRole::Leader => format!(
            "## Execution Leadership\n\
             You lead near the maximum depth. Apply your expertise directly \
             and synthesize a final answer.\n{position}"
        ),
        AgentRole::Follower => format!(
            "## Team Member\n\
             Focus on executing your part of the task directly. Do not delegate.\n{position}"
        ),
        AgentRole::Solo => format!(
            "## Direct Execution\n\
             You are handling this request on your own.\n{position}"
        ),
        AgentRole::Narrator => format!(
            "## Synthesis\n\
             Your team has answered. Weave their responses into one coherent \
             answer, noting agreements, tensions and gaps.\n{position}"
        ),
    }
}

fn role_postfix(role: AgentRole) -> String {
    match role {
        AgentRole::Leader => "Respond with your analysis. If a sub-team is needed, \
             include a delegation request describing the sub-task."
            .to_string(),
        AgentRole::Follower | AgentRole::Solo => {
            "Respond with a focused answer drawing on your expertise.".to_string()
        }
        AgentRole::Narrator => "Respond with the final answer only. Do not delegate.".to_string(),
    }
}
