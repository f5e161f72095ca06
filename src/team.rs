//! Team formation - member selection and role assignment

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::error::{Result, TroupeError};
use crate::types::{AgentId, AgentProfile, AgentRole, FormationStrategy};

/// Default leadership score a candidate needs to lead
pub const DEFAULT_LEADER_THRESHOLD: f64 = 0.7;

/// Parameters for one team formation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormationConfig {
    /// Seed for reproducible sampling
    #[serde(default)]
    pub seed: Option<u64>,
    /// Group shared by homogenous team members
    #[serde(default)]
    pub grouping_key: Option<String>,
    /// Caller's choice of leader
    #[serde(default)]
    pub designated_leader: Option<AgentId>,
    #[serde(default = "default_leader_threshold")]
    pub leader_threshold: f64,
    /// Form a smaller team instead of failing when candidates run short
    #[serde(default)]
    pub allow_partial_team: bool,
}

fn default_leader_threshold() -> f64 {
    DEFAULT_LEADER_THRESHOLD
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            grouping_key: None,
            designated_leader: None,
            leader_threshold: DEFAULT_LEADER_THRESHOLD,
            allow_partial_team: false,
        }
    }
}

impl FormationConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_grouping_key(mut self, key: impl Into<String>) -> Self {
        self.grouping_key = Some(key.into());
        self
    }

    pub fn with_designated_leader(mut self, agent: impl Into<AgentId>) -> Self {
        self.designated_leader = Some(agent.into());
        self
    }

    pub fn allow_partial(mut self) -> Self {
        self.allow_partial_team = true;
        self
    }
}

/// One selected member and its role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub agent: AgentId,
    pub role: AgentRole,
}

/// Outcome of team formation for one recursion node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamPlan {
    pub members: Vec<TeamMember>,
    pub formation_strategy: FormationStrategy,
    pub formation_config: FormationConfig,
}

impl TeamPlan {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The team's leader, if one was assigned
    pub fn leader(&self) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.role.is_leader())
    }
}

/// Select `ctx.team_size` members from `candidates` and assign their roles
///
/// Candidate order is the registry's preference; selected members keep that
/// relative order. Fails closed when the pool is too small unless the config
/// allows a partial team.
pub fn form_team(
    candidates: &[AgentProfile],
    ctx: &ExecutionContext,
    strategy: FormationStrategy,
    config: &FormationConfig,
) -> Result<TeamPlan> {
    let requested = ctx.team_size.max(1);
    let unique = dedupe(candidates);

    let pool: Vec<&AgentProfile> = match strategy {
        FormationStrategy::Random => unique,
        FormationStrategy::Homogenous => homogenous_pool(unique, config.grouping_key.as_deref()),
    };

    let size = if pool.len() >= requested {
        requested
    } else if config.allow_partial_team && !pool.is_empty() {
        debug!(
            requested,
            available = pool.len(),
            "Forming partial team"
        );
        pool.len()
    } else {
        return Err(TroupeError::InsufficientCandidates {
            requested,
            available: pool.len(),
        });
    };

    let selected = sample(&pool, size, config.seed);
    let roles = assign_roles(&selected, ctx, config);

    let members: Vec<TeamMember> = selected
        .iter()
        .zip(roles)
        .map(|(profile, role)| TeamMember {
            agent: profile.id.clone(),
            role,
        })
        .collect();

    info!(
        context_id = %ctx.context_id,
        strategy = %strategy,
        team_size = members.len(),
        leader = ?members.iter().find(|m| m.role.is_leader()).map(|m| m.agent.as_str()),
        "Formed team"
    );

    Ok(TeamPlan {
        members,
        formation_strategy: strategy,
        formation_config: config.clone(),
    })
}

fn dedupe(candidates: &[AgentProfile]) -> Vec<&AgentProfile> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect()
}

/// Candidates sharing the grouping key
///
/// Without a key, the group of the highest-ranked candidate is used.
fn homogenous_pool<'a>(
    candidates: Vec<&'a AgentProfile>,
    grouping_key: Option<&str>,
) -> Vec<&'a AgentProfile> {
    let key: Option<String> = match grouping_key {
        Some(k) => Some(k.to_string()),
        None => match candidates.first() {
            Some(first) => first.specialty.clone(),
            None => return Vec::new(),
        },
    };

    candidates
        .into_iter()
        .filter(|c| c.specialty == key)
        .collect()
}

fn sample<'a>(pool: &[&'a AgentProfile], size: usize, seed: Option<u64>) -> Vec<&'a AgentProfile> {
    if size >= pool.len() {
        return pool.to_vec();
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut indices = rand::seq::index::sample(&mut rng, pool.len(), size).into_vec();
    indices.sort_unstable();
    indices.into_iter().map(|i| pool[i]).collect()
}

/// Apply the leadership policy to the selected members
///
/// - a sole member of a root context is `Solo`
/// - within one level of `max_depth` everyone follows
/// - otherwise the designated leader leads, or failing that the highest
///   leadership score at or above the threshold
/// - at most one leader; the rest follow
pub fn assign_roles(
    selected: &[&AgentProfile],
    ctx: &ExecutionContext,
    config: &FormationConfig,
) -> Vec<AgentRole> {
    if selected.len() == 1 && ctx.depth == 0 {
        return vec![AgentRole::Solo];
    }

    let mut roles = vec![AgentRole::Follower; selected.len()];

    let near_max_depth = ctx.depth + 1 >= ctx.max_depth;
    if near_max_depth {
        return roles;
    }

    let designated = config
        .designated_leader
        .as_ref()
        .and_then(|leader| selected.iter().position(|p| &p.id == leader));

    let leader = designated.or_else(|| best_scoring(selected, config.leader_threshold));
    if let Some(idx) = leader {
        roles[idx] = AgentRole::Leader;
    }

    roles
}

fn best_scoring(selected: &[&AgentProfile], threshold: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, profile) in selected.iter().enumerate() {
        let Some(score) = profile.leadership_score else {
            continue;
        };
        if score < threshold {
            continue;
        }
        // Strictly greater keeps the earlier candidate on ties
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
}
