// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Pattern Repository Interface
//!
//! Persistence contract for the pattern cortex. The interface lives in the
//! domain layer; implementations live in `crate::infrastructure`:
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | `InMemoryPatternRepository` | process memory (development, tests) |
//! | `PostgresPatternRepository` | PostgreSQL via sqlx |
//!
//! ## Storage invariants
//!
//! - Rows are written whole; `importance` is never negative.
//! - Filtering happens inside the repository, never after loading every row.
//! - [`PatternRepository::commit_consolidation`] is all-or-nothing: importance
//!   updates, deletions, the estimator state and the audit record land
//!   together or not at all.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::consolidation::ConsolidationRecord;
use super::pattern::{OutcomeKind, Pattern, PatternId};

/// Equality/range filters applied by the repository scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Matches `subject_features.category`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_importance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_kind: Option<OutcomeKind>,
    /// Only patterns with `reward > 0`
    #[serde(default)]
    pub positive_only: bool,
}

impl PatternFilter {
    pub fn for_subject(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_min_importance(mut self, min_importance: f64) -> Self {
        self.min_importance = Some(min_importance);
        self
    }

    pub fn with_outcome_kind(mut self, kind: OutcomeKind) -> Self {
        self.outcome_kind = Some(kind);
        self
    }

    pub fn positive_only(mut self) -> Self {
        self.positive_only = true;
        self
    }

    /// Reference predicate shared by in-process backends
    pub fn matches(&self, pattern: &Pattern) -> bool {
        if let Some(ref subject_id) = self.subject_id {
            if &pattern.subject_id != subject_id {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if pattern.subject_features.category() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if pattern.importance < min {
                return false;
            }
        }
        if let Some(kind) = self.outcome_kind {
            if pattern.outcome_kind != kind {
                return false;
            }
        }
        if self.positive_only && pattern.reward <= 0.0 {
            return false;
        }
        true
    }
}

/// Persisted estimator slot (singleton row)
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorState {
    pub bytes: Vec<u8>,
    pub update_count: u32,
    pub last_decay_at: Option<DateTime<Utc>>,
}

/// Recomputed importance for one pattern. `observed` is the importance the
/// run scored from; backends apply `importance + (current - observed)` so
/// reinforcements that land while the run is in flight are kept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportanceUpdate {
    pub id: PatternId,
    pub observed: f64,
    pub importance: f64,
}

impl ImportanceUpdate {
    /// New importance given the row's current value, floored at zero
    pub fn apply(&self, current: f64) -> f64 {
        (self.importance + (current - self.observed)).max(0.0)
    }
}

/// Everything one consolidation run writes, applied atomically
#[derive(Debug, Clone)]
pub struct ConsolidationCommit {
    pub importance_updates: Vec<ImportanceUpdate>,
    pub deletions: Vec<PatternId>,
    pub estimator_state: EstimatorState,
    pub record: ConsolidationRecord,
}

/// Aggregates for metrics, computed by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStatistics {
    pub total_patterns: u64,
    pub counts_by_outcome: BTreeMap<OutcomeKind, u64>,
    pub average_importance: f64,
}

/// Repository for storing and retrieving patterns
#[async_trait]
pub trait PatternRepository: Send + Sync {
    /// Insert a new pattern row
    async fn insert(&self, pattern: &Pattern) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: PatternId) -> Result<Option<Pattern>, RepositoryError>;

    /// Filtered scan, evaluated by the backend
    async fn scan(&self, filter: &PatternFilter) -> Result<Vec<Pattern>, RepositoryError>;

    /// Atomically add to importance, bump access_count and set last_accessed_at.
    /// Returns the updated row.
    async fn reinforce(
        &self,
        id: PatternId,
        importance_delta: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<Pattern, RepositoryError>;

    /// Access bookkeeping for a set of read matches
    async fn record_access(
        &self,
        ids: &[PatternId],
        importance_boost: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn delete(&self, id: PatternId) -> Result<(), RepositoryError>;

    /// Every pattern (consolidation)
    async fn list_all(&self) -> Result<Vec<Pattern>, RepositoryError>;

    async fn count(&self) -> Result<u64, RepositoryError>;

    async fn statistics(&self) -> Result<PatternStatistics, RepositoryError>;

    async fn load_estimator_state(&self) -> Result<Option<EstimatorState>, RepositoryError>;

    async fn save_estimator_state(&self, state: &EstimatorState) -> Result<(), RepositoryError>;

    /// Apply a consolidation run atomically
    async fn commit_consolidation(&self, commit: &ConsolidationCommit) -> Result<(), RepositoryError>;

    /// Most recent consolidation records, newest first
    async fn consolidation_history(&self, limit: usize) -> Result<Vec<ConsolidationRecord>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
