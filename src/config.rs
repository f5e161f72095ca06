//! Configuration loading
//!
//! Precedence: explicit overrides > config file > defaults. A missing file
//! means defaults; a file that exists but does not parse is an error.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{Result, TroupeError};
use crate::narrator::NarratorConfig;
use crate::orchestrator::{OrchestratorConfig, RollupPolicy};
use crate::stream::DEFAULT_STREAM_CAPACITY;
use crate::team::{FormationConfig, DEFAULT_LEADER_THRESHOLD};

const DEFAULT_MAX_DEPTH: u32 = 3;
const DEFAULT_TEAM_SIZE: usize = 3;
const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 300;
const DEFAULT_PAUSE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_RETAIN_EXECUTIONS: usize = 128;

/// The TOML file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub orchestration: Option<OrchestrationSection>,
    pub team: Option<TeamSection>,
    pub stream: Option<StreamSection>,
    pub service: Option<ServiceSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationSection {
    pub max_depth: Option<u32>,
    pub team_size: Option<usize>,
    pub dispatch_timeout_secs: Option<u64>,
    pub rollup_policy: Option<RollupPolicy>,
    pub pause_timeout_secs: Option<u64>,
    /// Agent that synthesizes every root team's answers
    pub narrator: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TeamSection {
    pub leader_threshold: Option<f64>,
    pub allow_partial_team: Option<bool>,
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StreamSection {
    pub capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    /// Finished executions kept for lookup before the oldest is evicted
    pub retain_executions: Option<usize>,
}

impl ConfigFile {
    pub fn to_partial(self) -> PartialConfig {
        let orchestration = self.orchestration.unwrap_or_default();
        let team = self.team.unwrap_or_default();
        let stream = self.stream.unwrap_or_default();
        let service = self.service.unwrap_or_default();

        PartialConfig {
            max_depth: orchestration.max_depth,
            team_size: orchestration.team_size,
            dispatch_timeout_secs: orchestration.dispatch_timeout_secs,
            rollup_policy: orchestration.rollup_policy,
            pause_timeout_secs: orchestration.pause_timeout_secs,
            narrator: orchestration.narrator,
            leader_threshold: team.leader_threshold,
            allow_partial_team: team.allow_partial_team,
            seed: team.seed,
            stream_capacity: stream.capacity,
            retain_executions: service.retain_executions,
        }
    }
}

/// Fully-resolved configuration, every field has a value
#[derive(Debug, Clone, PartialEq)]
pub struct TroupeConfig {
    pub max_depth: u32,
    pub team_size: usize,
    pub dispatch_timeout_secs: u64,
    pub rollup_policy: RollupPolicy,
    pub pause_timeout_secs: u64,
    pub narrator: Option<String>,
    pub leader_threshold: f64,
    pub allow_partial_team: bool,
    pub seed: Option<u64>,
    pub stream_capacity: usize,
    pub retain_executions: usize,
}

impl Default for TroupeConfig {
    fn default() -> Self {
        PartialConfig::default().finalize()
    }
}

impl TroupeConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pause_timeout_secs)
    }

    pub fn formation_config(&self) -> FormationConfig {
        FormationConfig {
            seed: self.seed,
            leader_threshold: self.leader_threshold,
            allow_partial_team: self.allow_partial_team,
            ..FormationConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            dispatch_timeout: self.dispatch_timeout(),
            rollup_policy: self.rollup_policy,
            formation: self.formation_config(),
            pause_timeout: self.pause_timeout(),
            synthesis: self.narrator.as_deref().map(NarratorConfig::new),
        }
    }

    fn validate(self) -> Result<Self> {
        if self.team_size == 0 {
            return Err(TroupeError::Config("team_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.leader_threshold) {
            return Err(TroupeError::Config(format!(
                "leader_threshold must be within [0, 1], got {}",
                self.leader_threshold
            )));
        }
        if self.stream_capacity == 0 {
            return Err(TroupeError::Config("stream capacity must be at least 1".into()));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(TroupeError::Config("dispatch_timeout_secs must be at least 1".into()));
        }
        if self.pause_timeout_secs == 0 {
            return Err(TroupeError::Config("pause_timeout_secs must be at least 1".into()));
        }
        if self.retain_executions == 0 {
            return Err(TroupeError::Config("retain_executions must be at least 1".into()));
        }
        if self.narrator.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(TroupeError::Config("narrator must name an agent".into()));
        }
        Ok(self)
    }
}

/// Partial config used during merge
///
/// All fields are optional so that missing values never override a
/// lower-priority layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialConfig {
    pub max_depth: Option<u32>,
    pub team_size: Option<usize>,
    pub dispatch_timeout_secs: Option<u64>,
    pub rollup_policy: Option<RollupPolicy>,
    pub pause_timeout_secs: Option<u64>,
    pub narrator: Option<String>,
    pub leader_threshold: Option<f64>,
    pub allow_partial_team: Option<bool>,
    pub seed: Option<u64>,
    pub stream_capacity: Option<usize>,
    pub retain_executions: Option<usize>,
}

impl PartialConfig {
    /// Merge with a lower-priority fallback; `self` wins where set
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            max_depth: self.max_depth.or(fallback.max_depth),
            team_size: self.team_size.or(fallback.team_size),
            dispatch_timeout_secs: self.dispatch_timeout_secs.or(fallback.dispatch_timeout_secs),
            rollup_policy: self.rollup_policy.or(fallback.rollup_policy),
            pause_timeout_secs: self.pause_timeout_secs.or(fallback.pause_timeout_secs),
            narrator: self.narrator.or(fallback.narrator),
            leader_threshold: self.leader_threshold.or(fallback.leader_threshold),
            allow_partial_team: self.allow_partial_team.or(fallback.allow_partial_team),
            seed: self.seed.or(fallback.seed),
            stream_capacity: self.stream_capacity.or(fallback.stream_capacity),
            retain_executions: self.retain_executions.or(fallback.retain_executions),
        }
    }

    /// Fill remaining gaps with defaults
    pub fn finalize(self) -> TroupeConfig {
        TroupeConfig {
            max_depth: self.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            team_size: self.team_size.unwrap_or(DEFAULT_TEAM_SIZE),
            dispatch_timeout_secs: self
                .dispatch_timeout_secs
                .unwrap_or(DEFAULT_DISPATCH_TIMEOUT_SECS),
            rollup_policy: self.rollup_policy.unwrap_or_default(),
            pause_timeout_secs: self.pause_timeout_secs.unwrap_or(DEFAULT_PAUSE_TIMEOUT_SECS),
            narrator: self.narrator,
            leader_threshold: self.leader_threshold.unwrap_or(DEFAULT_LEADER_THRESHOLD),
            allow_partial_team: self.allow_partial_team.unwrap_or(false),
            seed: self.seed,
            stream_capacity: self.stream_capacity.unwrap_or(DEFAULT_STREAM_CAPACITY),
            retain_executions: self.retain_executions.unwrap_or(DEFAULT_RETAIN_EXECUTIONS),
        }
    }
}

/// Load configuration from an optional file plus explicit overrides
pub fn load_config(path: Option<&Path>, overrides: PartialConfig) -> Result<TroupeConfig> {
    let file = match path {
        Some(path) => load_toml_file(path)
            .map_err(|e| TroupeError::Config(format!("{e:#}")))?
            .unwrap_or_default(),
        None => PartialConfig::default(),
    };

    overrides.with_fallback(file).finalize().validate()
}

/// Parse a TOML config file into a partial config
///
/// `Ok(None)` when the file does not exist.
pub fn load_toml_file(path: &Path) -> anyhow::Result<Option<PartialConfig>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let file: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(Some(file.to_partial()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = TroupeConfig::default();
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.team_size, 3);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(300));
        assert_eq!(config.rollup_policy, RollupPolicy::Permissive);
        assert_eq!(config.leader_threshold, 0.7);
        assert!(!config.allow_partial_team);
        assert_eq!(config.stream_capacity, 256);
        assert_eq!(config.pause_timeout(), Duration::from_secs(600));
        assert_eq!(config.retain_executions, 128);
        assert!(config.narrator.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("troupe.toml");
        let config = load_config(Some(&path), PartialConfig::default()).unwrap();
        assert_eq!(config, TroupeConfig::default());
    }

    #[test]
    fn test_file_values_applied() {
        let file = write_config(
            r#"
            [orchestration]
            max_depth = 5
            rollup_policy = "strict"

            [team]
            seed = 7
            allow_partial_team = true

            [stream]
            capacity = 32
            "#,
        );

        let config = load_config(Some(file.path()), PartialConfig::default()).unwrap();
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.team_size, 3);
        assert_eq!(config.rollup_policy, RollupPolicy::Strict);
        assert_eq!(config.seed, Some(7));
        assert!(config.allow_partial_team);
        assert_eq!(config.stream_capacity, 32);
    }

    #[test]
    fn test_overrides_beat_file() {
        let file = write_config("[orchestration]\nmax_depth = 5\nteam_size = 4\n");
        let overrides = PartialConfig {
            max_depth: Some(1),
            ..Default::default()
        };

        let config = load_config(Some(file.path()), overrides).unwrap();
        assert_eq!(config.max_depth, 1);
        assert_eq!(config.team_size, 4);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let file = write_config("[orchestration\nmax_depth = ");
        let result = load_config(Some(file.path()), PartialConfig::default());
        assert!(matches!(result, Err(TroupeError::Config(_))));
    }

    #[test]
    fn test_unknown_key_is_error() {
        let file = write_config("[orchestration]\nmax_dept = 2\n");
        assert!(load_config(Some(file.path()), PartialConfig::default()).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let overrides = PartialConfig {
            leader_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(load_config(None, overrides).is_err());

        let overrides = PartialConfig {
            team_size: Some(0),
            ..Default::default()
        };
        assert!(load_config(None, overrides).is_err());
    }

    #[test]
    fn test_orchestrator_config_mapping() {
        let config = PartialConfig {
            dispatch_timeout_secs: Some(5),
            seed: Some(11),
            ..Default::default()
        }
        .finalize();

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.dispatch_timeout, Duration::from_secs(5));
        assert_eq!(orchestrator.formation.seed, Some(11));
        assert_eq!(orchestrator.formation.leader_threshold, 0.7);
        assert_eq!(orchestrator.pause_timeout, Duration::from_secs(600));
        assert!(orchestrator.synthesis.is_none());
    }

    #[test]
    fn test_narrator_and_retention_from_file() {
        let file = write_config(
            r#"
            [orchestration]
            pause_timeout_secs = 45
            narrator = "reader"

            [service]
            retain_executions = 8
            "#,
        );

        let config = load_config(Some(file.path()), PartialConfig::default()).unwrap();
        assert_eq!(config.retain_executions, 8);

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.pause_timeout, Duration::from_secs(45));
        assert_eq!(orchestrator.synthesis, Some(NarratorConfig::new("reader")));
    }

    #[test]
    fn test_zero_retention_rejected() {
        let overrides = PartialConfig {
            retain_executions: Some(0),
            ..Default::default()
        };
        assert!(matches!(load_config(None, overrides), Err(TroupeError::Config(_))));
    }
}
