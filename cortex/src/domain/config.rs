// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Pattern Cortex Configuration
//
// Tunables for deduplication, pruning, consolidation and scheduling, plus the
// storage backend selection. Loaded from YAML (`pattern-cortex.yaml`) with
// every field optional; durations use humantime strings ("1h", "30days").

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ValidationError;

/// Environment variable that overrides the configured Postgres connection string
pub const DATABASE_URL_ENV: &str = "PATTERN_CORTEX_DATABASE_URL";

/// How `store_pattern` reacts when a consolidation is due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationMode {
    /// Run synchronously before `store_pattern` returns
    Inline,
    /// Signal the background scheduler and return immediately
    Background,
    /// Only explicit `consolidate()` calls (and the scheduler interval) run it
    Manual,
}

impl Default for ConsolidationMode {
    fn default() -> Self {
        ConsolidationMode::Inline
    }
}

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    InMemory,
    Postgres { connection_string: String },
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::InMemory
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStoreConfig {
    /// Embedding dimensionality D, fixed for the lifetime of the store
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Soft capacity target enforced by consolidation
    #[serde(default = "default_max_patterns")]
    pub max_patterns: u64,

    /// Cosine similarity above which an observation merges into an existing pattern
    #[serde(default = "default_deduplication_threshold")]
    pub deduplication_threshold: f64,

    /// Patterns at or above this importance survive even over capacity
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f64,

    /// Scale applied to a fresh pattern's base importance
    #[serde(default = "default_initial_importance_scale")]
    pub initial_importance_scale: f64,

    /// Importance added to a pattern every time a query returns it
    #[serde(default = "default_access_importance_boost")]
    pub access_importance_boost: f64,

    /// Fraction of new-since-last-run patterns that makes consolidation due
    #[serde(default = "default_consolidation_ratio")]
    pub consolidation_ratio: f64,

    /// Fraction of `max_patterns` that forces consolidation
    #[serde(default = "default_capacity_trigger_fraction")]
    pub capacity_trigger_fraction: f64,

    #[serde(default = "default_min_consolidation_interval", with = "humantime_serde")]
    pub min_consolidation_interval: Duration,

    /// Multiplicative decay applied to the Fisher running sums each run
    #[serde(default = "default_fisher_decay")]
    pub fisher_decay: f64,

    /// Patterns resampled into the estimator each run
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    #[serde(default = "default_recency_half_life", with = "humantime_serde")]
    pub recency_half_life: Duration,

    /// Preservation rate below which a run is reported as degraded
    #[serde(default = "default_target_preservation_rate")]
    pub target_preservation_rate: f64,

    #[serde(default)]
    pub consolidation_mode: ConsolidationMode,

    /// Background scheduler tick; the scheduler is off when `None`
    #[serde(default = "default_scheduler_interval", with = "humantime_serde")]
    pub scheduler_interval: Option<Duration>,

    /// Seed for the consolidation resampling RNG (reproducible runs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_seed: Option<u64>,

    #[serde(default = "default_query_limit")]
    pub default_query_limit: usize,

    #[serde(default)]
    pub storage: StorageBackend,
}

fn default_dimensions() -> usize {
    384
}

fn default_max_patterns() -> u64 {
    10_000
}

fn default_deduplication_threshold() -> f64 {
    0.95
}

fn default_importance_threshold() -> f64 {
    0.1
}

fn default_initial_importance_scale() -> f64 {
    0.05
}

fn default_access_importance_boost() -> f64 {
    0.01
}

fn default_consolidation_ratio() -> f64 {
    0.10
}

fn default_capacity_trigger_fraction() -> f64 {
    0.9
}

fn default_min_consolidation_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_fisher_decay() -> f64 {
    0.95
}

fn default_sample_size() -> usize {
    100
}

fn default_recency_half_life() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

fn default_target_preservation_rate() -> f64 {
    0.95
}

fn default_scheduler_interval() -> Option<Duration> {
    Some(Duration::from_secs(3600))
}

fn default_query_limit() -> usize {
    10
}

impl Default for PatternStoreConfig {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            max_patterns: default_max_patterns(),
            deduplication_threshold: default_deduplication_threshold(),
            importance_threshold: default_importance_threshold(),
            initial_importance_scale: default_initial_importance_scale(),
            access_importance_boost: default_access_importance_boost(),
            consolidation_ratio: default_consolidation_ratio(),
            capacity_trigger_fraction: default_capacity_trigger_fraction(),
            min_consolidation_interval: default_min_consolidation_interval(),
            fisher_decay: default_fisher_decay(),
            sample_size: default_sample_size(),
            recency_half_life: default_recency_half_life(),
            target_preservation_rate: default_target_preservation_rate(),
            consolidation_mode: ConsolidationMode::default(),
            scheduler_interval: default_scheduler_interval(),
            sample_seed: None,
            default_query_limit: default_query_limit(),
            storage: StorageBackend::default(),
        }
    }
}

impl PatternStoreConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `PATTERN_CORTEX_DATABASE_URL` switches storage to Postgres
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.storage = StorageBackend::Postgres { connection_string: url };
            }
        }
    }

    /// Number of patterns at which consolidation is forced
    pub fn capacity_trigger(&self) -> f64 {
        self.max_patterns as f64 * self.capacity_trigger_fraction
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        fn in_unit(v: f64) -> bool {
            v.is_finite() && v > 0.0 && v <= 1.0
        }

        if self.dimensions == 0 {
            return Err(invalid("dimensions must be positive"));
        }
        if self.max_patterns == 0 {
            return Err(invalid("max_patterns must be positive"));
        }
        if !in_unit(self.deduplication_threshold) {
            return Err(invalid("deduplication_threshold must be within (0, 1]"));
        }
        if !self.importance_threshold.is_finite() || self.importance_threshold < 0.0 {
            return Err(invalid("importance_threshold must be a non-negative number"));
        }
        if !self.initial_importance_scale.is_finite() || self.initial_importance_scale <= 0.0 {
            return Err(invalid("initial_importance_scale must be positive"));
        }
        if !self.access_importance_boost.is_finite() || self.access_importance_boost < 0.0 {
            return Err(invalid("access_importance_boost must be non-negative"));
        }
        if !in_unit(self.consolidation_ratio) {
            return Err(invalid("consolidation_ratio must be within (0, 1]"));
        }
        if !in_unit(self.capacity_trigger_fraction) {
            return Err(invalid("capacity_trigger_fraction must be within (0, 1]"));
        }
        if !(self.fisher_decay > 0.0 && self.fisher_decay < 1.0) {
            return Err(invalid("fisher_decay must be within (0, 1)"));
        }
        if self.recency_half_life.is_zero() {
            return Err(invalid("recency_half_life must be positive"));
        }
        if !(0.0..=1.0).contains(&self.target_preservation_rate) {
            return Err(invalid("target_preservation_rate must be within [0, 1]"));
        }
        if self.default_query_limit == 0 {
            return Err(invalid("default_query_limit must be positive"));
        }
        if matches!(self.scheduler_interval, Some(d) if d.is_zero()) {
            return Err(invalid("scheduler_interval must be positive when set"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ValidationError {
    ValidationError::InvalidConfig(reason.to_string())
}
