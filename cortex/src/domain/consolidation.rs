// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Consolidation Policy
//!
//! Pure decision logic for the consolidation ("sleep") cycle: when a run is
//! due, how each pattern's importance is recomputed, and which patterns are
//! pruned. Orchestration and persistence live in
//! `crate::application::consolidation_engine`.
//!
//! ## Importance
//!
//! ```text
//! importance = reward_weight * recency * access * fisher
//!   reward_weight = |reward| (x1.5 when reward > 0)
//!   recency       = 0.5 ^ (age_since_last_access / half_life)
//!   access        = 1 + ln(1 + access_count)
//!   fisher        = alignment(pattern) / mean alignment over the store
//! ```
//!
//! `alignment` is the mean of `importance[i] * |embedding[i]|`. Dividing by
//! the store-wide mean keeps the absolute pruning thresholds independent of
//! the embedding scale while preserving the ordering between patterns.
//!
//! ## Pruning
//!
//! Over capacity, the lowest-importance patterns are removed down to
//! `max_patterns`, but only while they sit below `importance_threshold`.
//! Regardless of capacity, patterns below a tenth of the threshold are noise
//! and always removed. Capacity is a soft target; the threshold is not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::PatternStoreConfig;
use super::importance::ImportanceEstimator;
use super::pattern::{Pattern, PatternId};

/// Append-only audit row describing one consolidation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// False for skipped runs; skipped runs are never persisted
    #[serde(default = "default_consolidated")]
    pub consolidated: bool,
    pub processed: u64,
    pub preserved: u64,
    pub pruned: u64,
    pub preservation_rate: f64,
    pub duration_ms: u64,
    pub avg_importance: f64,
}

fn default_consolidated() -> bool {
    true
}

impl ConsolidationRecord {
    /// Record for a run that did not happen
    pub fn skipped(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            consolidated: false,
            processed: 0,
            preserved: 0,
            pruned: 0,
            preservation_rate: 1.0,
            duration_ms: 0,
            avg_importance: 0.0,
        }
    }
}

/// Why `should_consolidate` answered the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationDecision {
    TooSoon,
    NewPatternRatio,
    NearCapacity,
    NotNeeded,
}

impl ConsolidationDecision {
    pub fn is_due(self) -> bool {
        matches!(
            self,
            ConsolidationDecision::NewPatternRatio | ConsolidationDecision::NearCapacity
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConsolidationDecision::TooSoon => "too_soon",
            ConsolidationDecision::NewPatternRatio => "new_pattern_ratio",
            ConsolidationDecision::NearCapacity => "near_capacity",
            ConsolidationDecision::NotNeeded => "not_needed",
        }
    }
}

/// Inputs to the scheduling decision
#[derive(Debug, Clone, Copy)]
pub struct ConsolidationTrigger {
    pub total_patterns: u64,
    pub new_since_last: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

pub fn should_consolidate(trigger: &ConsolidationTrigger, config: &PatternStoreConfig) -> ConsolidationDecision {
    if let Some(last) = trigger.last_run_at {
        let elapsed = (trigger.now - last).to_std().unwrap_or_default();
        if elapsed < config.min_consolidation_interval {
            return ConsolidationDecision::TooSoon;
        }
    }

    if trigger.total_patterns > 0 && trigger.new_since_last > 0 {
        let ratio = trigger.new_since_last as f64 / trigger.total_patterns as f64;
        if ratio >= config.consolidation_ratio {
            return ConsolidationDecision::NewPatternRatio;
        }
    }

    if trigger.total_patterns > 0 && trigger.total_patterns as f64 >= config.capacity_trigger() {
        return ConsolidationDecision::NearCapacity;
    }

    ConsolidationDecision::NotNeeded
}

/// `|reward|`, boosted by half again for positive rewards
pub fn reward_weight(reward: f64) -> f64 {
    if reward > 0.0 {
        reward * 1.5
    } else {
        reward.abs()
    }
}

/// Exponential decay with the configured half-life; 1.0 for future timestamps
pub fn recency_factor(last_accessed_at: DateTime<Utc>, now: DateTime<Utc>, half_life: std::time::Duration) -> f64 {
    let age = (now - last_accessed_at).to_std().unwrap_or_default();
    let half_life = half_life.as_secs_f64();
    if half_life <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age.as_secs_f64() / half_life)
}

pub fn access_factor(access_count: u64) -> f64 {
    1.0 + (1.0 + access_count as f64).ln()
}

/// Recomputed importance for every pattern, in input order.
///
/// The Fisher factor is a pattern's alignment divided by the mean alignment
/// of the whole batch, so scores are relative to the other patterns scored
/// with it: a batch-average pattern gets a factor of 1 and
/// `importance_threshold` is compared against that scale.
pub fn score_patterns(
    patterns: &[Pattern],
    estimator: &ImportanceEstimator,
    now: DateTime<Utc>,
    config: &PatternStoreConfig,
) -> Vec<f64> {
    let alignments: Vec<f64> = patterns
        .iter()
        .map(|p| estimator.alignment(&p.context_embedding))
        .collect();
    let mean_alignment = if alignments.is_empty() {
        0.0
    } else {
        alignments.iter().sum::<f64>() / alignments.len() as f64
    };

    patterns
        .iter()
        .zip(&alignments)
        .map(|(pattern, alignment)| {
            let fisher = if mean_alignment > 0.0 {
                alignment / mean_alignment
            } else {
                1.0
            };
            let score = reward_weight(pattern.reward)
                * recency_factor(pattern.last_accessed_at, now, config.recency_half_life)
                * access_factor(pattern.access_count)
                * fisher;
            if score.is_finite() {
                score.max(0.0)
            } else {
                0.0
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrunePlan {
    pub pruned: Vec<PatternId>,
    pub preserved: u64,
}

impl PrunePlan {
    pub fn preservation_rate(&self) -> f64 {
        let total = self.preserved + self.pruned.len() as u64;
        if total == 0 {
            return 1.0;
        }
        self.preserved as f64 / total as f64
    }
}

/// Decide which patterns to delete given their recomputed importance.
pub fn plan_pruning(scored: &[(PatternId, f64)], config: &PatternStoreConfig) -> PrunePlan {
    let mut ascending: Vec<&(PatternId, f64)> = scored.iter().collect();
    ascending.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let total = scored.len() as u64;
    let mut excess = total.saturating_sub(config.max_patterns);
    let noise_floor = config.importance_threshold / 10.0;

    let mut pruned = Vec::new();
    for (id, importance) in ascending {
        if excess > 0 && *importance < config.importance_threshold {
            pruned.push(*id);
            excess -= 1;
        } else if *importance < noise_floor {
            pruned.push(*id);
        }
    }

    PrunePlan {
        preserved: total - pruned.len() as u64,
        pruned,
    }
}
