//! Configuration loading and validation.
//!
//! Hierarchical merge, lowest to highest precedence: programmatic
//! defaults, `<data>/config.yaml`, then `MANIFEST_*` environment
//! variables (nested keys split on `__`).

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::{CheckStage, ManifestConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid generation count {0}; must be between 1 and max_count")]
    InvalidGenerationCount(u32),

    #[error("Strategy distribution sums to {actual}, expected {expected}")]
    DistributionMismatch { actual: u32, expected: u32 },

    #[error("Invalid cost ceiling {0}; must be positive")]
    InvalidCostCeiling(f64),

    #[error("Invalid AI concurrency {0}; must be at least 1")]
    InvalidAiConcurrency(usize),

    #[error("Invalid harness concurrency {0}; must be at least 1")]
    InvalidHarnessConcurrency(usize),

    #[error("Stage {0} has an empty command")]
    EmptyStageCommand(CheckStage),

    #[error("Ranking weights sum to {0}; must sum to 1.0")]
    InvalidRankingWeights(f64),

    #[error("Invalid top_k {0}; must be at least 1")]
    InvalidTopK(usize),

    #[error("Invalid workspace disk cap {0}; must be positive")]
    InvalidDiskCap(u64),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}; must be json or pretty")]
    InvalidLogFormat(String),

    #[error("Invalid retry backoff: initial {0}ms must not exceed max {1}ms")]
    InvalidBackoff(u64, u64),
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a data directory.
    pub fn load(data_dir: &str) -> Result<ManifestConfig> {
        let config: ManifestConfig = Figment::new()
            .merge(Serialized::defaults(ManifestConfig::default()))
            .merge(Yaml::file(format!("{data_dir}/config.yaml")))
            .merge(Env::prefixed("MANIFEST_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from an explicit file, for tests and one-off tools.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<ManifestConfig> {
        let config: ManifestConfig = Figment::new()
            .merge(Serialized::defaults(ManifestConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &ManifestConfig) -> Result<(), ConfigError> {
        let generation = &config.generation;
        if generation.default_count == 0 || generation.default_count > generation.max_count {
            return Err(ConfigError::InvalidGenerationCount(generation.default_count));
        }
        let distributed: u32 = generation.strategy_counts().iter().map(|(_, n)| n).sum();
        if distributed != generation.default_count {
            return Err(ConfigError::DistributionMismatch {
                actual: distributed,
                expected: generation.default_count,
            });
        }
        if generation.cost_ceiling_usd <= 0.0 {
            return Err(ConfigError::InvalidCostCeiling(generation.cost_ceiling_usd));
        }

        if config.ai.max_outstanding == 0 {
            return Err(ConfigError::InvalidAiConcurrency(config.ai.max_outstanding));
        }
        if config.ai.initial_backoff_ms > config.ai.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.ai.initial_backoff_ms,
                config.ai.max_backoff_ms,
            ));
        }

        if config.verification.harness_concurrency == 0 {
            return Err(ConfigError::InvalidHarnessConcurrency(
                config.verification.harness_concurrency,
            ));
        }
        for stage in CheckStage::ordered() {
            if config.verification.command_for(stage).argv.is_empty() {
                return Err(ConfigError::EmptyStageCommand(stage));
            }
        }

        if config.workspace.disk_cap_bytes == 0 {
            return Err(ConfigError::InvalidDiskCap(config.workspace.disk_cap_bytes));
        }

        if config.ranking.top_k == 0 {
            return Err(ConfigError::InvalidTopK(config.ranking.top_k));
        }
        let weight_sum = config.ranking.weight_sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidRankingWeights(weight_sum));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        if !["json", "pretty"].contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ConfigLoader::validate(&ManifestConfig::default()).expect("defaults must validate");
    }

    #[test]
    fn distribution_must_sum_to_count() {
        let mut config = ManifestConfig::default();
        config.generation.default_count = 7;
        let result = ConfigLoader::validate(&config);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::DistributionMismatch { expected: 7, .. }
        ));
    }

    #[test]
    fn zero_cost_ceiling_rejected() {
        let mut config = ManifestConfig::default();
        config.generation.cost_ceiling_usd = 0.0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidCostCeiling(_)
        ));
    }

    #[test]
    fn empty_stage_command_rejected() {
        let mut config = ManifestConfig::default();
        config.verification.lint.argv.clear();
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::EmptyStageCommand(CheckStage::Lint)
        ));
    }

    #[test]
    fn ranking_weights_must_sum_to_one() {
        let mut config = ManifestConfig::default();
        config.ranking.weight_simplicity = 0.9;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidRankingWeights(_)
        ));
    }

    #[test]
    fn invalid_log_format_rejected() {
        let mut config = ManifestConfig::default();
        config.logging.format = "xml".into();
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidLogFormat(_)
        ));
    }

    #[test]
    fn file_overrides_defaults() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "generation:\n  default_count: 4\n  distribution:\n    vanilla: 2\n    minimal: 1\n    defensive: 1"
        )
        .unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.generation.default_count, 4);
        // Untouched sections keep their defaults.
        assert_eq!(config.ranking.top_k, 3);
    }
}
