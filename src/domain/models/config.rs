//! Configuration model.
//!
//! One YAML file in the data directory carries every tunable; sections
//! mirror the components they configure. Defaults here are the documented
//! baseline and are merged under file and environment overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::attempt::Strategy;

/// Root configuration for a Manifest deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Data directory holding the database, workspaces/ and logs/.
    pub data_dir: String,
    pub database: DatabaseConfig,
    pub ai: AiConfig,
    pub generation: GenerationConfig,
    pub verification: VerificationConfig,
    pub workspace: WorkspaceConfig,
    pub ranking: RankingConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            data_dir: ".manifest".into(),
            database: DatabaseConfig::default(),
            ai: AiConfig::default(),
            generation: GenerationConfig::default(),
            verification: VerificationConfig::default(),
            workspace: WorkspaceConfig::default(),
            ranking: RankingConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ManifestConfig {
    pub fn database_path(&self) -> String {
        format!("{}/{}", self.data_dir, self.database.file)
    }

    pub fn workspaces_dir(&self) -> String {
        format!("{}/workspaces", self.data_dir)
    }

    pub fn logs_dir(&self) -> String {
        format!("{}/logs", self.data_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file name inside the data directory.
    pub file: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file: "manifest.db".into(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub base_url: String,
    pub model: String,
    /// Global ceiling on outstanding completion calls.
    pub max_outstanding: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Cooldown after a rate-limit signal before concurrency recovers.
    pub cooldown_secs: u64,
    /// Deadline for a single completion call.
    pub call_deadline_secs: u64,
    pub max_tokens: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".into(),
            model: "claude-sonnet-4-5".into(),
            max_outstanding: 8,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            cooldown_secs: 30,
            call_deadline_secs: 120,
            max_tokens: 8_192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Attempts per batch when the caller does not say otherwise.
    pub default_count: u32,
    pub max_count: u32,
    /// Per-strategy share of the batch; values sum to the batch size.
    /// Missing strategies get zero.
    pub distribution: BTreeMap<String, u32>,
    /// Hard USD ceiling for one run's AI spend.
    pub cost_ceiling_usd: f64,
    /// Projected cost of one completion call, used for admission before
    /// actual usage is known.
    pub estimated_call_cost_usd: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let mut distribution = BTreeMap::new();
        distribution.insert(Strategy::Vanilla.as_str().to_string(), 2);
        distribution.insert(Strategy::Minimal.as_str().to_string(), 1);
        distribution.insert(Strategy::Defensive.as_str().to_string(), 1);
        distribution.insert(Strategy::Patterned.as_str().to_string(), 1);
        Self {
            default_count: 5,
            max_count: 20,
            distribution,
            cost_ceiling_usd: 5.0,
            estimated_call_cost_usd: 0.10,
        }
    }
}

impl GenerationConfig {
    /// Expand the configured distribution into (strategy, count) pairs,
    /// skipping unknown names and zero counts.
    pub fn strategy_counts(&self) -> Vec<(Strategy, u32)> {
        self.distribution
            .iter()
            .filter_map(|(name, &count)| {
                let strategy = Strategy::from_str(name)?;
                (count > 0).then_some((strategy, count))
            })
            .collect()
    }
}

/// Argv for one external checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCommand {
    pub argv: Vec<String>,
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub typecheck: StageCommand,
    pub lint: StageCommand,
    pub unit_tests: StageCommand,
    pub spec_tests: StageCommand,
    /// Re-runs for flaky unit/spec stages; a stage passes when passes
    /// strictly exceed half the runs.
    pub flaky_retries: u32,
    /// Concurrent verifications, independent of the AI pool.
    pub harness_concurrency: usize,
    /// Reserved workspace-relative path for the spec test suite.
    pub spec_suite_path: String,
    pub auto_install_dependencies: bool,
    pub allow_network_in_tests: bool,
    /// Byte cap per captured subprocess stream.
    pub stream_cap_bytes: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            typecheck: StageCommand {
                argv: vec!["cargo".into(), "check".into()],
                deadline_secs: 300,
            },
            lint: StageCommand {
                argv: vec![
                    "cargo".into(),
                    "clippy".into(),
                    "--".into(),
                    "-D".into(),
                    "warnings".into(),
                ],
                deadline_secs: 300,
            },
            unit_tests: StageCommand {
                argv: vec!["cargo".into(), "test".into()],
                deadline_secs: 600,
            },
            spec_tests: StageCommand {
                argv: vec![
                    "cargo".into(),
                    "test".into(),
                    "--test".into(),
                    "manifest_spec".into(),
                ],
                deadline_secs: 600,
            },
            flaky_retries: 2,
            harness_concurrency: 3,
            spec_suite_path: "tests/manifest_spec.rs".into(),
            auto_install_dependencies: false,
            allow_network_in_tests: false,
            stream_cap_bytes: 256 * 1024,
        }
    }
}

impl VerificationConfig {
    pub fn command_for(&self, stage: super::verification::CheckStage) -> &StageCommand {
        use super::verification::CheckStage;
        match stage {
            CheckStage::Typecheck => &self.typecheck,
            CheckStage::Lint => &self.lint,
            CheckStage::UnitTests => &self.unit_tests,
            CheckStage::SpecTests => &self.spec_tests,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Cap on total workspace bytes on disk.
    pub disk_cap_bytes: u64,
    /// How long acquisition may block waiting for capacity.
    pub acquire_deadline_secs: u64,
    /// Whether to remove workspaces on release. Disable only to debug.
    pub cleanup: bool,
    /// Directory names excluded from the project copy.
    pub exclude: Vec<String>,
    /// Files larger than this are excluded from the copy.
    pub max_file_bytes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            disk_cap_bytes: 2 * 1024 * 1024 * 1024,
            acquire_deadline_secs: 300,
            cleanup: true,
            exclude: vec![
                ".git".into(),
                "target".into(),
                "node_modules".into(),
                ".manifest".into(),
            ],
            max_file_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// How many survivors to present.
    pub top_k: usize,
    pub weight_assertions: f64,
    pub weight_simplicity: f64,
    pub weight_readability: f64,
    pub weight_performance: f64,
    /// Whether to request AI readability scores.
    pub readability_enabled: bool,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            weight_assertions: 0.5,
            weight_simplicity: 0.25,
            weight_readability: 0.15,
            weight_performance: 0.1,
            readability_enabled: false,
        }
    }
}

impl RankingConfig {
    pub fn weight_sum(&self) -> f64 {
        self.weight_assertions
            + self.weight_simplicity
            + self.weight_readability
            + self.weight_performance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Refinement count past which a loop warning is surfaced.
    pub refinement_warning_threshold: u32,
    /// How many aggregated failure reasons a no-survivors report carries.
    pub failure_report_reasons: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            refinement_warning_threshold: 3,
            failure_report_reasons: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_distribution_sums_to_default_count() {
        let config = GenerationConfig::default();
        let total: u32 = config.strategy_counts().iter().map(|(_, n)| n).sum();
        assert_eq!(total, config.default_count);
    }

    #[test]
    fn unknown_strategy_names_are_skipped() {
        let mut config = GenerationConfig::default();
        config.distribution.insert("telepathic".into(), 4);
        let names: Vec<Strategy> = config.strategy_counts().iter().map(|(s, _)| *s).collect();
        assert!(!names.is_empty());
        assert!(names.iter().all(|s| Strategy::from_str(s.as_str()).is_some()));
    }

    #[test]
    fn default_ranking_weights_sum_to_one() {
        let config = RankingConfig::default();
        assert!((config.weight_sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn yaml_round_trip() {
        let config = ManifestConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: ManifestConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, back);
    }
}
