//! Candidate source - where team formation gets its agents

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::types::{AgentId, AgentProfile};

/// What the caller is looking for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCriteria {
    /// Query the team will work on
    pub query: String,
    /// Restrict to one specialty
    #[serde(default)]
    pub specialty: Option<String>,
    /// Upper bound on the number of candidates returned
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Outbound candidate query
///
/// The returned order is a preference used only to break ties.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidates(&self, criteria: &CandidateCriteria) -> Result<Vec<AgentProfile>>;
}

/// In-memory registry in registration order
#[derive(Clone, Default)]
pub struct StaticRegistry {
    agents: Arc<RwLock<Vec<AgentProfile>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: impl IntoIterator<Item = AgentProfile>) -> Self {
        let registry = Self::new();
        for agent in agents {
            registry.register(agent);
        }
        registry
    }

    /// Add or replace an agent, keeping its original position on replace
    pub fn register(&self, profile: AgentProfile) {
        let mut agents = self.agents.write();
        match agents.iter_mut().find(|a| a.id == profile.id) {
            Some(existing) => *existing = profile,
            None => agents.push(profile),
        }
    }

    pub fn remove(&self, id: &AgentId) -> Option<AgentProfile> {
        let mut agents = self.agents.write();
        let index = agents.iter().position(|a| &a.id == id)?;
        Some(agents.remove(index))
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentProfile> {
        self.agents.read().iter().find(|a| &a.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

#[async_trait]
impl CandidateSource for StaticRegistry {
    async fn candidates(&self, criteria: &CandidateCriteria) -> Result<Vec<AgentProfile>> {
        let agents = self.agents.read();
        let limit = criteria.limit.unwrap_or(usize::MAX);

        let matches: Vec<AgentProfile> = agents
            .iter()
            .filter(|a| match &criteria.specialty {
                Some(specialty) => a.specialty.as_deref() == Some(specialty.as_str()),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect();

        debug!(
            specialty = ?criteria.specialty,
            returned = matches.len(),
            registered = agents.len(),
            "Candidate query"
        );
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_registry() -> StaticRegistry {
        StaticRegistry::with_agents([
            AgentProfile::new("alice").with_specialty("finance"),
            AgentProfile::new("bob").with_specialty("legal"),
            AgentProfile::new("carol").with_specialty("finance"),
        ])
    }

    #[tokio::test]
    async fn test_candidates_keep_registration_order() {
        let registry = create_registry();
        let found = registry
            .candidates(&CandidateCriteria::default())
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_specialty_and_limit() {
        let registry = create_registry();
        let criteria = CandidateCriteria {
            specialty: Some("finance".into()),
            limit: Some(1),
            ..Default::default()
        };
        let found = registry.candidates(&criteria).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "alice");
    }

    #[test]
    fn test_register_replaces_in_place() {
        let registry = create_registry();
        registry.register(AgentProfile::new("bob").with_leadership_score(0.9));

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get(&AgentId::from("bob")).unwrap().leadership_score,
            Some(0.9)
        );
        assert!(registry.remove(&AgentId::from("bob")).is_some());
        assert!(registry.get(&AgentId::from("bob")).is_none());
    }
}
