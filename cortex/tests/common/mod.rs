// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pattern_cortex::{
    ConsolidationCommit, ConsolidationMode, ConsolidationRecord, ContextEncoder, EncoderError, EstimatorState,
    InMemoryPatternRepository, Pattern, PatternFilter, PatternId, PatternRepository, PatternStatistics,
    PatternStoreConfig, RecommendationContext, RepositoryError,
};

/// Deterministic pseudo-random unit vector per context text. Distinct texts
/// produce nearly orthogonal vectors in high dimensions.
pub struct SeededEncoder {
    pub dimensions: usize,
    pub fail: AtomicBool,
}

impl SeededEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ContextEncoder for SeededEncoder {
    async fn encode(&self, context: &RecommendationContext) -> Result<Vec<f32>, EncoderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EncoderError::Unavailable("embedding service down".to_string()));
        }
        Ok(seeded_vector(&context.text, self.dimensions))
    }
}

pub fn seeded_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());

    let raw: Vec<f32> = (0..dimensions).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    raw.into_iter().map(|v| v / norm).collect()
}

/// Manual consolidation, no minimum interval, reproducible sampling
pub fn manual_config(dimensions: usize) -> PatternStoreConfig {
    PatternStoreConfig {
        dimensions,
        consolidation_mode: ConsolidationMode::Manual,
        min_consolidation_interval: Duration::ZERO,
        scheduler_interval: None,
        sample_seed: Some(42),
        ..PatternStoreConfig::default()
    }
}

/// In-memory repository with switchable failure injection
#[derive(Default)]
pub struct FailingRepository {
    pub inner: InMemoryPatternRepository,
    pub fail_writes: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_access: AtomicBool,
    /// Reinforce this pattern just before the next commit is applied
    pub reinforce_before_commit: Mutex<Option<(PatternId, f64)>>,
}

impl FailingRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), RepositoryError> {
        if flag.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database(format!("injected failure: {}", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl PatternRepository for FailingRepository {
    async fn insert(&self, pattern: &Pattern) -> Result<(), RepositoryError> {
        self.check(&self.fail_writes, "insert")?;
        self.inner.insert(pattern).await
    }

    async fn find_by_id(&self, id: PatternId) -> Result<Option<Pattern>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn scan(&self, filter: &PatternFilter) -> Result<Vec<Pattern>, RepositoryError> {
        self.inner.scan(filter).await
    }

    async fn reinforce(
        &self,
        id: PatternId,
        importance_delta: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<Pattern, RepositoryError> {
        self.check(&self.fail_writes, "reinforce")?;
        self.inner.reinforce(id, importance_delta, accessed_at).await
    }

    async fn record_access(
        &self,
        ids: &[PatternId],
        importance_boost: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.check(&self.fail_access, "record_access")?;
        self.inner.record_access(ids, importance_boost, accessed_at).await
    }

    async fn delete(&self, id: PatternId) -> Result<(), RepositoryError> {
        self.check(&self.fail_writes, "delete")?;
        self.inner.delete(id).await
    }

    async fn list_all(&self) -> Result<Vec<Pattern>, RepositoryError> {
        self.inner.list_all().await
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        self.inner.count().await
    }

    async fn statistics(&self) -> Result<PatternStatistics, RepositoryError> {
        self.inner.statistics().await
    }

    async fn load_estimator_state(&self) -> Result<Option<EstimatorState>, RepositoryError> {
        self.inner.load_estimator_state().await
    }

    async fn save_estimator_state(&self, state: &EstimatorState) -> Result<(), RepositoryError> {
        self.check(&self.fail_writes, "save_estimator_state")?;
        self.inner.save_estimator_state(state).await
    }

    async fn commit_consolidation(&self, commit: &ConsolidationCommit) -> Result<(), RepositoryError> {
        self.check(&self.fail_commit, "commit_consolidation")?;
        let pending = self.reinforce_before_commit.lock().take();
        if let Some((id, delta)) = pending {
            self.inner.reinforce(id, delta, Utc::now()).await?;
        }
        self.inner.commit_consolidation(commit).await
    }

    async fn consolidation_history(&self, limit: usize) -> Result<Vec<ConsolidationRecord>, RepositoryError> {
        self.inner.consolidation_history(limit).await
    }
}
