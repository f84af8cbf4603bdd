// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory implementation of PatternRepository for development and tests.
//! All state sits behind one `RwLock`, so every method is trivially atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::consolidation::ConsolidationRecord;
use crate::domain::pattern::{Pattern, PatternId};
use crate::domain::repository::{
    ConsolidationCommit, EstimatorState, PatternFilter, PatternRepository, PatternStatistics,
    RepositoryError,
};

#[derive(Default)]
struct InMemoryState {
    patterns: HashMap<PatternId, Pattern>,
    estimator: Option<EstimatorState>,
    history: Vec<ConsolidationRecord>,
}

#[derive(Clone, Default)]
pub struct InMemoryPatternRepository {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryPatternRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatternRepository for InMemoryPatternRepository {
    async fn insert(&self, pattern: &Pattern) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.patterns.contains_key(&pattern.id) {
            return Err(RepositoryError::Database(format!("Pattern {} already exists", pattern.id)));
        }
        state.patterns.insert(pattern.id, pattern.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: PatternId) -> Result<Option<Pattern>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.patterns.get(&id).cloned())
    }

    async fn scan(&self, filter: &PatternFilter) -> Result<Vec<Pattern>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .patterns
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn reinforce(
        &self,
        id: PatternId,
        importance_delta: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<Pattern, RepositoryError> {
        let mut state = self.state.write().await;
        let pattern = state
            .patterns
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Pattern {} not found", id)))?;
        pattern.reinforce(importance_delta, accessed_at);
        Ok(pattern.clone())
    }

    async fn record_access(
        &self,
        ids: &[PatternId],
        importance_boost: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(pattern) = state.patterns.get_mut(id) {
                pattern.record_access(importance_boost, accessed_at);
            }
        }
        Ok(())
    }

    async fn delete(&self, id: PatternId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state
            .patterns
            .remove(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Pattern {} not found", id)))?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Pattern>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.patterns.values().cloned().collect())
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.patterns.len() as u64)
    }

    async fn statistics(&self) -> Result<PatternStatistics, RepositoryError> {
        let state = self.state.read().await;
        let mut stats = PatternStatistics {
            total_patterns: state.patterns.len() as u64,
            ..PatternStatistics::default()
        };
        let mut importance_sum = 0.0;
        for pattern in state.patterns.values() {
            *stats.counts_by_outcome.entry(pattern.outcome_kind).or_insert(0) += 1;
            importance_sum += pattern.importance;
        }
        if stats.total_patterns > 0 {
            stats.average_importance = importance_sum / stats.total_patterns as f64;
        }
        Ok(stats)
    }

    async fn load_estimator_state(&self) -> Result<Option<EstimatorState>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.estimator.clone())
    }

    async fn save_estimator_state(&self, estimator: &EstimatorState) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.estimator = Some(estimator.clone());
        Ok(())
    }

    async fn commit_consolidation(&self, commit: &ConsolidationCommit) -> Result<(), RepositoryError> {
        if let Some(update) = commit
            .importance_updates
            .iter()
            .find(|u| !u.importance.is_finite() || u.importance < 0.0 || !u.observed.is_finite())
        {
            return Err(RepositoryError::Serialization(format!(
                "Invalid importance {} for pattern {}",
                update.importance, update.id
            )));
        }

        let mut state = self.state.write().await;
        for update in &commit.importance_updates {
            // Rows deleted concurrently are simply skipped
            if let Some(pattern) = state.patterns.get_mut(&update.id) {
                pattern.importance = update.apply(pattern.importance);
            }
        }
        for id in &commit.deletions {
            state.patterns.remove(id);
        }
        state.estimator = Some(commit.estimator_state.clone());
        state.history.push(commit.record.clone());
        Ok(())
    }

    async fn consolidation_history(&self, limit: usize) -> Result<Vec<ConsolidationRecord>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.history.iter().rev().take(limit).cloned().collect())
    }
}
