// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Pattern Store - facade over the pattern cortex
//!
//! Entry point for the upstream recommender: records outcomes
//! ([`PatternStore::store_pattern`]), answers similarity queries
//! ([`PatternStore::find_similar_patterns`]) and runs consolidation.
//!
//! # Concurrency
//!
//! - The estimator, the embedding centroid and the new-since-consolidation
//!   counter live in one [`LearningState`] behind an async mutex.
//! - Readers never touch that lock. After every mutation the store publishes
//!   an immutable [`LearningSnapshot`] (importance vector behind an `Arc`).
//! - Merge-or-insert decisions are serialized per `subject_id`.
//! - At most one consolidation runs at a time; a concurrent request gets a
//!   skipped record instead of waiting.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::consolidation_engine::{ConsolidationEngine, LearningState};
use crate::domain::config::{ConsolidationMode, PatternStoreConfig};
use crate::domain::consolidation::{should_consolidate, ConsolidationRecord, ConsolidationTrigger};
use crate::domain::encoder::{gradient, gradient_from_mean, ContextEncoder, PatternEncoder};
use crate::domain::errors::{PatternStoreError, Result};
use crate::domain::events::{EventBus, PatternCortexEvent};
use crate::domain::importance::{EmbeddingCentroid, ImportanceEstimator};
use crate::domain::pattern::{Outcome, OutcomeKind, Pattern, PatternId, PatternInput, RecommendationContext};
use crate::domain::repository::{PatternFilter, PatternRepository};
use crate::domain::similarity::{self, SimilarPattern};

/// Consolidation records considered by the metrics summary
const HISTORY_WINDOW: usize = 100;

/// Rough per-row overhead (ids, timestamps, JSON, indexes) for size estimates
const PATTERN_ROW_OVERHEAD_BYTES: u64 = 256;
const HISTORY_ROW_BYTES: u64 = 96;

/// Immutable view of the learning state handed to readers
#[derive(Debug, Clone)]
pub struct LearningSnapshot {
    pub importance: Arc<Vec<f64>>,
    pub average_importance: f64,
    pub update_count: u32,
    pub writes_since_consolidation: u64,
    pub last_consolidation_at: Option<DateTime<Utc>>,
}

impl LearningSnapshot {
    fn capture(state: &LearningState) -> Self {
        Self {
            importance: Arc::new(state.estimator.importance_vector()),
            average_importance: state.estimator.average_importance(),
            update_count: state.estimator.update_count(),
            writes_since_consolidation: state.writes_since_consolidation,
            last_consolidation_at: state.last_consolidation_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationSummary {
    /// Completed runs within the summarized window
    pub runs: usize,
    pub last_run: Option<ConsolidationRecord>,
    pub total_pruned: u64,
    pub average_preservation_rate: f64,
    pub min_preservation_rate: f64,
    pub runs_below_target: usize,
}

impl ConsolidationSummary {
    fn from_history(history: &[ConsolidationRecord], target: f64) -> Self {
        if history.is_empty() {
            return Self {
                average_preservation_rate: 1.0,
                min_preservation_rate: 1.0,
                ..Self::default()
            };
        }
        let rates = history.iter().map(|r| r.preservation_rate);
        Self {
            runs: history.len(),
            last_run: history.first().cloned(),
            total_pruned: history.iter().map(|r| r.pruned).sum(),
            average_preservation_rate: rates.clone().sum::<f64>() / history.len() as f64,
            min_preservation_rate: rates.fold(f64::INFINITY, f64::min),
            runs_below_target: history.iter().filter(|r| r.preservation_rate < target).count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStoreMetrics {
    pub total_patterns: u64,
    pub counts_by_outcome: BTreeMap<OutcomeKind, u64>,
    pub average_importance: f64,
    pub estimator_average_importance: f64,
    pub estimator_update_count: u32,
    pub writes_since_consolidation: u64,
    pub capacity: u64,
    /// True when consolidation could not bring the store under `capacity`
    pub capacity_exceeded: bool,
    pub consolidation: ConsolidationSummary,
    pub storage_size_bytes: u64,
}

pub struct PatternStore {
    config: PatternStoreConfig,
    repository: Arc<dyn PatternRepository>,
    encoder: PatternEncoder,
    event_bus: Arc<dyn EventBus>,
    engine: ConsolidationEngine,
    learning: Mutex<LearningState>,
    snapshot: RwLock<LearningSnapshot>,
    subject_locks: DashMap<String, Arc<Mutex<()>>>,
    consolidation_signal: Arc<Notify>,
    scheduler_token: parking_lot::Mutex<Option<CancellationToken>>,
}

impl PatternStore {
    /// Open a store over `repository`, restoring the persisted estimator and
    /// rebuilding the embedding centroid from the stored patterns.
    pub async fn open(
        config: PatternStoreConfig,
        repository: Arc<dyn PatternRepository>,
        encoder: Arc<dyn ContextEncoder>,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        let dimensions = config.dimensions;

        let mut state = LearningState::new(dimensions);
        if let Some(saved) = repository.load_estimator_state().await? {
            state.estimator = ImportanceEstimator::deserialize(&saved.bytes, dimensions)?;
            if state.estimator.update_count() != saved.update_count {
                warn!(
                    stored = saved.update_count,
                    decoded = state.estimator.update_count(),
                    "Estimator update count column disagrees with serialized state"
                );
            }
        }

        let patterns = repository.list_all().await?;
        let mut centroid = EmbeddingCentroid::new(dimensions);
        centroid.resync(patterns.iter().map(|p| p.context_embedding.as_slice()));
        state.centroid = centroid;

        state.last_consolidation_at = repository
            .consolidation_history(1)
            .await?
            .first()
            .map(|r| r.timestamp);
        state.writes_since_consolidation = patterns
            .iter()
            .filter(|p| state.last_consolidation_at.map_or(true, |last| p.created_at > last))
            .count() as u64;

        info!(
            dimensions,
            patterns = patterns.len(),
            estimator_updates = state.estimator.update_count(),
            mode = ?config.consolidation_mode,
            "Pattern store opened"
        );

        let engine = ConsolidationEngine::new(repository.clone(), event_bus.clone(), config.clone());
        Ok(Self {
            encoder: PatternEncoder::new(encoder, dimensions),
            snapshot: RwLock::new(LearningSnapshot::capture(&state)),
            learning: Mutex::new(state),
            config,
            repository,
            event_bus,
            engine,
            subject_locks: DashMap::new(),
            consolidation_signal: Arc::new(Notify::new()),
            scheduler_token: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PatternStoreConfig {
        &self.config
    }

    /// Current immutable learning snapshot
    pub fn snapshot(&self) -> LearningSnapshot {
        self.snapshot.read().clone()
    }

    /// Record an observed outcome. Returns the id of the new pattern, or of
    /// the existing pattern the observation was merged into.
    pub async fn store_pattern(&self, input: PatternInput, outcome: Outcome) -> Result<PatternId> {
        outcome.validate()?;
        let embedding = self.encoder.encode(&input.context).await?;
        let base_importance = outcome.base_importance() * self.config.initial_importance_scale;
        let now = Utc::now();

        let subject_lock = self.subject_lock(&input.subject_id);
        let guard = subject_lock.lock().await;
        let result = self.merge_or_insert(input, outcome, embedding, base_importance, now).await;
        drop(guard);
        self.release_subject_lock(subject_lock);

        let id = result?;
        self.maybe_trigger_consolidation().await;
        Ok(id)
    }

    async fn merge_or_insert(
        &self,
        input: PatternInput,
        outcome: Outcome,
        embedding: Vec<f32>,
        base_importance: f64,
        now: DateTime<Utc>,
    ) -> Result<PatternId> {
        let candidates = self
            .repository
            .scan(&PatternFilter::for_subject(input.subject_id.as_str()))
            .await?;

        if let Some((existing, similarity)) = similarity::best_match(&embedding, &candidates) {
            if similarity > self.config.deduplication_threshold
                && self.encoder.validate(&existing.context_embedding).is_ok()
            {
                let merge_gradient = gradient(&embedding, &existing.context_embedding);
                let old_importance = existing.importance;
                let updated = self.repository.reinforce(existing.id, base_importance, now).await?;

                {
                    let mut state = self.learning.lock().await;
                    state.estimator.update(&merge_gradient)?;
                    state.writes_since_consolidation += 1;
                    self.publish_snapshot(&state);
                }

                debug!(
                    pattern_id = %updated.id,
                    subject_id = %updated.subject_id,
                    similarity,
                    access_count = updated.access_count,
                    "Merged observation into existing pattern"
                );
                metrics::counter!("pattern_cortex_patterns_stored_total", "action" => "reinforced").increment(1);
                self.publish(PatternCortexEvent::PatternReinforced {
                    pattern_id: updated.id,
                    similarity,
                    old_importance,
                    new_importance: updated.importance,
                    access_count: updated.access_count,
                    timestamp: now,
                })
                .await;
                return Ok(updated.id);
            }
        }

        let pattern = Pattern::new(
            embedding,
            input.subject_id,
            input.subject_features,
            outcome.kind,
            base_importance,
        );
        self.repository.insert(&pattern).await?;

        {
            let mut state = self.learning.lock().await;
            let novelty = gradient_from_mean(&pattern.context_embedding, &state.centroid.mean());
            state.estimator.update(&novelty)?;
            state.centroid.add(&pattern.context_embedding);
            state.writes_since_consolidation += 1;
            self.publish_snapshot(&state);
        }

        debug!(
            pattern_id = %pattern.id,
            subject_id = %pattern.subject_id,
            outcome = %pattern.outcome_kind,
            importance = pattern.importance,
            "Stored new pattern"
        );
        metrics::counter!("pattern_cortex_patterns_stored_total", "action" => "inserted").increment(1);
        self.publish(PatternCortexEvent::PatternDiscovered {
            pattern_id: pattern.id,
            subject_id: pattern.subject_id.clone(),
            outcome_kind: pattern.outcome_kind,
            initial_importance: pattern.importance,
            timestamp: now,
        })
        .await;
        Ok(pattern.id)
    }

    /// Patterns most similar to `query`, ranked by importance-weighted cosine.
    /// `limit` defaults to `default_query_limit`.
    pub async fn find_similar_patterns(
        &self,
        query: &RecommendationContext,
        filter: &PatternFilter,
        limit: Option<usize>,
    ) -> Result<Vec<SimilarPattern>> {
        let embedding = self.encoder.encode(query).await?;
        let candidates = self.repository.scan(filter).await?;
        metrics::counter!("pattern_cortex_queries_total").increment(1);

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let importance = self.snapshot.read().importance.clone();
        let limit = limit.unwrap_or(self.config.default_query_limit);
        let mut results = similarity::rank(&embedding, candidates, &importance, limit);
        if results.is_empty() {
            return Ok(results);
        }

        let ids: Vec<PatternId> = results.iter().map(|r| r.pattern.id).collect();
        let now = Utc::now();
        let boost = self.config.access_importance_boost;
        match self.repository.record_access(&ids, boost, now).await {
            Ok(()) => {
                for result in results.iter_mut() {
                    result.pattern.record_access(boost, now);
                }
            }
            Err(e) => {
                warn!(error = %e, matches = ids.len(), "Failed to record pattern access after query");
            }
        }

        Ok(results)
    }

    /// Run consolidation now (subject to `should_consolidate`)
    pub async fn consolidate(&self) -> Result<ConsolidationRecord> {
        let Some(_run) = self.engine.try_begin() else {
            return Ok(self.engine.skip("in_flight").await);
        };

        let mut state = self.learning.lock().await;
        let record = self.engine.run(&mut state).await?;
        if record.consolidated {
            self.publish_snapshot(&state);
        }
        Ok(record)
    }

    pub async fn get_pattern_importance(&self, id: PatternId) -> Result<f64> {
        self.repository
            .find_by_id(id)
            .await?
            .map(|p| p.importance)
            .ok_or(PatternStoreError::NotFound(id))
    }

    /// Read-only aggregate view; does not touch access statistics
    pub async fn get_metrics(&self) -> Result<PatternStoreMetrics> {
        let stats = self.repository.statistics().await?;
        let history = self.repository.consolidation_history(HISTORY_WINDOW).await?;
        let snapshot = self.snapshot();

        let embedding_bytes = (self.config.dimensions * std::mem::size_of::<f32>()) as u64;
        let storage_size_bytes = stats.total_patterns * (embedding_bytes + PATTERN_ROW_OVERHEAD_BYTES)
            + ImportanceEstimator::serialized_len(self.config.dimensions) as u64
            + history.len() as u64 * HISTORY_ROW_BYTES;

        Ok(PatternStoreMetrics {
            total_patterns: stats.total_patterns,
            counts_by_outcome: stats.counts_by_outcome,
            average_importance: stats.average_importance,
            estimator_average_importance: snapshot.average_importance,
            estimator_update_count: snapshot.update_count,
            writes_since_consolidation: snapshot.writes_since_consolidation,
            capacity: self.config.max_patterns,
            capacity_exceeded: stats.total_patterns > self.config.max_patterns,
            consolidation: ConsolidationSummary::from_history(&history, self.config.target_preservation_rate),
            storage_size_bytes,
        })
    }

    /// Persist the current estimator state
    pub async fn checkpoint(&self) -> Result<()> {
        let state = self.learning.lock().await;
        let last_decay_at = state.last_consolidation_at;
        self.repository
            .save_estimator_state(&state.estimator_state(last_decay_at))
            .await?;
        debug!(update_count = state.estimator.update_count(), "Estimator checkpointed");
        Ok(())
    }

    /// Stop the background scheduler (if any) and checkpoint the estimator
    pub async fn close(&self) -> Result<()> {
        if let Some(token) = self.scheduler_token.lock().take() {
            token.cancel();
        }
        self.checkpoint().await?;
        info!("Pattern store closed");
        Ok(())
    }

    /// Signal used by the background scheduler
    pub fn consolidation_signal(&self) -> Arc<Notify> {
        self.consolidation_signal.clone()
    }

    /// Register the cancellation token of an attached scheduler so that
    /// [`Self::close`] can stop it.
    pub fn attach_scheduler(&self, token: CancellationToken) {
        if let Some(previous) = self.scheduler_token.lock().replace(token) {
            previous.cancel();
        }
    }

    async fn maybe_trigger_consolidation(&self) {
        if self.config.consolidation_mode == ConsolidationMode::Manual {
            return;
        }
        let (writes, last_run_at) = {
            let snapshot = self.snapshot.read();
            (snapshot.writes_since_consolidation, snapshot.last_consolidation_at)
        };
        let total = match self.repository.count().await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "Could not count patterns for consolidation trigger");
                return;
            }
        };

        let decision = should_consolidate(
            &ConsolidationTrigger {
                total_patterns: total,
                new_since_last: writes,
                last_run_at,
                now: Utc::now(),
            },
            &self.config,
        );
        if !decision.is_due() {
            return;
        }
        debug!(reason = decision.as_str(), "Consolidation due after write");

        match self.config.consolidation_mode {
            ConsolidationMode::Inline => {
                if let Err(e) = self.consolidate().await {
                    warn!(error = %e, "Inline consolidation failed; pattern was stored");
                }
            }
            ConsolidationMode::Background => self.consolidation_signal.notify_one(),
            ConsolidationMode::Manual => {}
        }
    }

    fn publish_snapshot(&self, state: &LearningState) {
        *self.snapshot.write() = LearningSnapshot::capture(state);
    }

    fn subject_lock(&self, subject_id: &str) -> Arc<Mutex<()>> {
        self.subject_locks
            .entry(subject_id.to_string())
            .or_default()
            .clone()
    }

    fn release_subject_lock(&self, lock: Arc<Mutex<()>>) {
        drop(lock);
        // Only the map still references an idle lock
        self.subject_locks.retain(|_, l| Arc::strong_count(l) > 1);
    }

    async fn publish(&self, event: PatternCortexEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish cortex event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{EncoderError, ValidationError};
    use crate::infrastructure::event_bus::BroadcastEventBus;
    use crate::infrastructure::in_memory_repository::InMemoryPatternRepository;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Maps known context texts to fixed vectors
    struct TableEncoder;

    #[async_trait]
    impl ContextEncoder for TableEncoder {
        async fn encode(&self, context: &RecommendationContext) -> std::result::Result<Vec<f32>, EncoderError> {
            match context.text.as_str() {
                "rust" => Ok(vec![1.0, 0.0, 0.0]),
                "rust-ish" => Ok(vec![0.99, 0.05, 0.0]),
                "python" => Ok(vec![0.0, 1.0, 0.0]),
                "go" => Ok(vec![0.0, 0.0, 1.0]),
                "wide" => Ok(vec![1.0, 0.0]),
                _ => Err(EncoderError::Unavailable("unknown context".to_string())),
            }
        }
    }

    fn config() -> PatternStoreConfig {
        PatternStoreConfig {
            dimensions: 3,
            consolidation_mode: ConsolidationMode::Manual,
            min_consolidation_interval: Duration::ZERO,
            sample_seed: Some(1),
            ..PatternStoreConfig::default()
        }
    }

    async fn store(config: PatternStoreConfig) -> (PatternStore, Arc<InMemoryPatternRepository>) {
        let repo = Arc::new(InMemoryPatternRepository::new());
        let store = PatternStore::open(config, repo.clone(), Arc::new(TableEncoder), Arc::new(BroadcastEventBus::new(64)))
            .await
            .unwrap();
        (store, repo)
    }

    fn input(text: &str, subject: &str) -> PatternInput {
        PatternInput::new(RecommendationContext::new(text), subject)
    }

    #[tokio::test]
    async fn test_store_new_pattern() {
        let (store, repo) = store(config()).await;
        let id = store
            .store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept))
            .await
            .unwrap();

        let pattern = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(pattern.reward, 1.0);
        assert_eq!(pattern.access_count, 0);
        assert!((pattern.importance - 1.5 * 0.05).abs() < 1e-12);
        assert!(pattern.importance < store.config().importance_threshold);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.update_count, 1);
        assert_eq!(snapshot.writes_since_consolidation, 1);
    }

    #[tokio::test]
    async fn test_near_duplicate_merges() {
        let (store, repo) = store(config()).await;
        let first = store
            .store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Usage))
            .await
            .unwrap();
        let second = store
            .store_pattern(input("rust-ish", "skill-a"), Outcome::new(OutcomeKind::Usage))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.count().await.unwrap(), 1);
        let pattern = repo.find_by_id(first).await.unwrap().unwrap();
        assert_eq!(pattern.access_count, 1);
        assert_eq!(pattern.context_embedding, vec![1.0, 0.0, 0.0]);
        assert_eq!(store.snapshot().update_count, 2);
    }

    #[tokio::test]
    async fn test_different_subjects_never_merge() {
        let (store, repo) = store(config()).await;
        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("rust", "skill-b"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_mutation() {
        let (store, repo) = store(config()).await;

        let err = store
            .store_pattern(input("rust", "skill-a"), Outcome::with_confidence(OutcomeKind::Accept, 2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PatternStoreError::Validation(ValidationError::InvalidConfidence(_))));

        let err = store
            .store_pattern(input("wide", "skill-a"), Outcome::new(OutcomeKind::Accept))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PatternStoreError::Validation(ValidationError::DimensionMismatch { expected: 3, actual: 2 })
        ));

        let err = store
            .store_pattern(input("cobol", "skill-a"), Outcome::new(OutcomeKind::Accept))
            .await
            .unwrap_err();
        assert!(matches!(err, PatternStoreError::Encoder(_)));

        assert_eq!(repo.count().await.unwrap(), 0);
        assert_eq!(store.snapshot().update_count, 0);
    }

    #[tokio::test]
    async fn test_find_similar_updates_access() {
        let (store, repo) = store(config()).await;
        let rust = store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("python", "skill-b"), Outcome::new(OutcomeKind::Accept)).await.unwrap();

        let results = store
            .find_similar_patterns(&RecommendationContext::new("rust"), &PatternFilter::default(), Some(1))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].pattern.id, rust);
        assert_eq!(results[0].rank, 1);
        assert!((results[0].similarity - 1.0).abs() < 1e-9);
        assert_eq!(results[0].pattern.access_count, 1);
        assert_eq!(repo.find_by_id(rust).await.unwrap().unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn test_find_similar_empty_is_ok() {
        let (store, _) = store(config()).await;
        let results = store
            .find_similar_patterns(&RecommendationContext::new("go"), &PatternFilter::for_subject("nobody"), None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_second_consolidation_processes_nothing() {
        let (store, _) = store(config()).await;
        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("go", "skill-b"), Outcome::new(OutcomeKind::Dismiss)).await.unwrap();

        let first = store.consolidate().await.unwrap();
        assert!(first.consolidated);
        assert_eq!(first.processed, 2);

        let second = store.consolidate().await.unwrap();
        assert!(!second.consolidated);
        assert_eq!(second.processed, 0);
    }

    #[tokio::test]
    async fn test_concurrent_consolidation_is_skipped() {
        let (store, _) = store(config()).await;
        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();

        let _held = store.engine.try_begin().unwrap();
        let record = store.consolidate().await.unwrap();
        assert!(!record.consolidated);
        assert_eq!(store.snapshot().writes_since_consolidation, 1);
    }

    #[tokio::test]
    async fn test_inline_mode_consolidates_on_write() {
        let mut cfg = config();
        cfg.consolidation_mode = ConsolidationMode::Inline;
        let (store, repo) = store(cfg).await;

        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();

        assert_eq!(repo.consolidation_history(10).await.unwrap().len(), 1);
        assert_eq!(store.snapshot().writes_since_consolidation, 0);
    }

    #[tokio::test]
    async fn test_inline_mode_respects_min_interval() {
        let mut cfg = config();
        cfg.consolidation_mode = ConsolidationMode::Inline;
        cfg.min_consolidation_interval = Duration::from_secs(3600);
        let repo = Arc::new(InMemoryPatternRepository::new());
        let bus = BroadcastEventBus::new(64);
        let mut events = bus.subscribe();
        let store = PatternStore::open(cfg, repo.clone(), Arc::new(TableEncoder), Arc::new(bus))
            .await
            .unwrap();

        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("python", "skill-b"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("go", "skill-c"), Outcome::new(OutcomeKind::Usage)).await.unwrap();

        assert_eq!(repo.consolidation_history(10).await.unwrap().len(), 1);
        assert_eq!(store.snapshot().writes_since_consolidation, 2);
        let mut skipped = 0;
        while let Ok(event) = events.try_recv() {
            if event.event_type() == "consolidation_skipped" {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 0);
    }

    #[tokio::test]
    async fn test_background_mode_signals_scheduler() {
        let mut cfg = config();
        cfg.consolidation_mode = ConsolidationMode::Background;
        let (store, repo) = store(cfg).await;
        let signal = store.consolidation_signal();

        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();

        // The stored permit resolves immediately
        tokio::time::timeout(Duration::from_secs(1), signal.notified()).await.unwrap();
        assert!(repo.consolidation_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_pattern_importance() {
        let (store, _) = store(config()).await;
        let id = store.store_pattern(input("go", "skill-a"), Outcome::new(OutcomeKind::Dismiss)).await.unwrap();

        assert!((store.get_pattern_importance(id).await.unwrap() - 0.5 * 0.05).abs() < 1e-12);
        let missing = PatternId::new();
        assert!(matches!(
            store.get_pattern_importance(missing).await,
            Err(PatternStoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_metrics() {
        let (store, _) = store(config()).await;
        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("go", "skill-b"), Outcome::new(OutcomeKind::Uninstall)).await.unwrap();

        let metrics = store.get_metrics().await.unwrap();
        assert_eq!(metrics.total_patterns, 2);
        assert_eq!(metrics.counts_by_outcome[&OutcomeKind::Accept], 1);
        assert_eq!(metrics.counts_by_outcome[&OutcomeKind::Uninstall], 1);
        assert_eq!(metrics.writes_since_consolidation, 2);
        assert!(!metrics.capacity_exceeded);
        assert_eq!(metrics.consolidation.runs, 0);
        assert_eq!(metrics.consolidation.min_preservation_rate, 1.0);
        assert!(metrics.storage_size_bytes > 0);
    }

    #[tokio::test]
    async fn test_close_checkpoints_and_reopen_restores() {
        let (store, repo) = store(config()).await;
        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("python", "skill-b"), Outcome::new(OutcomeKind::Usage)).await.unwrap();
        let before = store.snapshot();

        let token = CancellationToken::new();
        store.attach_scheduler(token.clone());
        store.close().await.unwrap();
        assert!(token.is_cancelled());

        let reopened = PatternStore::open(config(), repo, Arc::new(TableEncoder), Arc::new(BroadcastEventBus::new(8)))
            .await
            .unwrap();
        let after = reopened.snapshot();
        assert_eq!(after.update_count, before.update_count);
        assert_eq!(after.importance, before.importance);
        assert_eq!(after.writes_since_consolidation, 2);
    }

    #[tokio::test]
    async fn test_open_rejects_mismatched_estimator() {
        let repo = Arc::new(InMemoryPatternRepository::new());
        repo.save_estimator_state(&LearningState::new(5).estimator_state(None)).await.unwrap();

        let result = PatternStore::open(config(), repo, Arc::new(TableEncoder), Arc::new(BroadcastEventBus::new(8))).await;
        assert!(matches!(result, Err(PatternStoreError::Estimator(_))));
    }

    #[tokio::test]
    async fn test_events_published() {
        let repo = Arc::new(InMemoryPatternRepository::new());
        let bus = BroadcastEventBus::new(16);
        let mut receiver = bus.subscribe();
        let store = PatternStore::open(config(), repo, Arc::new(TableEncoder), Arc::new(bus)).await.unwrap();

        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap().event_type(), "pattern_discovered");
        assert_eq!(receiver.recv().await.unwrap().event_type(), "pattern_reinforced");
    }

    #[tokio::test]
    async fn test_subject_locks_released() {
        let (store, _) = store(config()).await;
        store.store_pattern(input("rust", "skill-a"), Outcome::new(OutcomeKind::Accept)).await.unwrap();
        assert!(store.subject_locks.is_empty());
    }
}
