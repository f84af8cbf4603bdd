// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Consolidation Engine - the "sleep cycle" of the pattern cortex
//!
//! Orchestrates one consolidation run against the learning state owned by
//! [`super::pattern_store::PatternStore`]:
//!
//! 1. decide whether a run is due ([`should_consolidate`])
//! 2. decay the Fisher running sums
//! 3. resample stored embeddings into the estimator (mean recomputed exactly)
//! 4. recompute every pattern's importance and plan pruning
//! 5. commit importance updates, deletions, estimator state and the audit
//!    record in one repository call
//!
//! The estimator is updated on a copy. The live learning state is only
//! replaced once the commit has succeeded, so a failed run leaves both the
//! repository and the in-memory state as they were.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::config::PatternStoreConfig;
use crate::domain::consolidation::{
    plan_pruning, score_patterns, should_consolidate, ConsolidationDecision, ConsolidationRecord,
    ConsolidationTrigger,
};
use crate::domain::encoder::gradient_from_mean;
use crate::domain::errors::PatternStoreError;
use crate::domain::events::{EventBus, PatternCortexEvent};
use crate::domain::importance::{EmbeddingCentroid, ImportanceEstimator};
use crate::domain::pattern::{Pattern, PatternId};
use crate::domain::repository::{ConsolidationCommit, EstimatorState, ImportanceUpdate, PatternRepository};

/// Mutable learning state shared by every write and by consolidation.
/// Always accessed under the store's single-writer lock.
#[derive(Debug, Clone)]
pub struct LearningState {
    pub estimator: ImportanceEstimator,
    pub centroid: EmbeddingCentroid,
    pub writes_since_consolidation: u64,
    pub last_consolidation_at: Option<DateTime<Utc>>,
}

impl LearningState {
    pub fn new(dimensions: usize) -> Self {
        Self {
            estimator: ImportanceEstimator::new(dimensions),
            centroid: EmbeddingCentroid::new(dimensions),
            writes_since_consolidation: 0,
            last_consolidation_at: None,
        }
    }

    pub fn estimator_state(&self, last_decay_at: Option<DateTime<Utc>>) -> EstimatorState {
        EstimatorState {
            bytes: self.estimator.serialize().to_vec(),
            update_count: self.estimator.update_count(),
            last_decay_at,
        }
    }
}

/// Held for the duration of one run; clears the in-flight flag on drop
pub struct ConsolidationGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ConsolidationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct ConsolidationEngine {
    repository: Arc<dyn PatternRepository>,
    event_bus: Arc<dyn EventBus>,
    config: PatternStoreConfig,
    in_flight: AtomicBool,
}

impl ConsolidationEngine {
    pub fn new(
        repository: Arc<dyn PatternRepository>,
        event_bus: Arc<dyn EventBus>,
        config: PatternStoreConfig,
    ) -> Self {
        Self {
            repository,
            event_bus,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the single in-flight slot. `None` when a run is already active.
    pub fn try_begin(&self) -> Option<ConsolidationGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ConsolidationGuard { flag: &self.in_flight })
    }

    /// No-op record for a run that did not happen
    pub async fn skip(&self, reason: &str) -> ConsolidationRecord {
        let record = ConsolidationRecord::skipped(Utc::now());
        debug!(reason, "Consolidation skipped");
        metrics::counter!("pattern_cortex_consolidations_total", "result" => "skipped").increment(1);
        self.publish(PatternCortexEvent::ConsolidationSkipped {
            reason: reason.to_string(),
            timestamp: record.timestamp,
        })
        .await;
        record
    }

    /// Execute one run against `state`. The caller must hold a guard from
    /// [`Self::try_begin`] and the store's learning-state lock.
    pub async fn run(&self, state: &mut LearningState) -> Result<ConsolidationRecord, PatternStoreError> {
        let started = Instant::now();
        let now = Utc::now();

        let total = self.repository.count().await?;
        let decision = should_consolidate(
            &ConsolidationTrigger {
                total_patterns: total,
                new_since_last: state.writes_since_consolidation,
                last_run_at: state.last_consolidation_at,
                now,
            },
            &self.config,
        );
        if !decision.is_due() {
            return Ok(self.skip(decision.as_str()).await);
        }

        info!(
            reason = decision.as_str(),
            total_patterns = total,
            new_since_last = state.writes_since_consolidation,
            "Starting consolidation"
        );

        match self.consolidate(state, decision, now, started).await {
            Ok(record) => Ok(record),
            Err(e) => {
                error!(error = %e, "Consolidation aborted, store left unchanged");
                metrics::counter!("pattern_cortex_consolidations_total", "result" => "failed").increment(1);
                Err(e)
            }
        }
    }

    async fn consolidate(
        &self,
        state: &mut LearningState,
        decision: ConsolidationDecision,
        now: DateTime<Utc>,
        started: Instant,
    ) -> Result<ConsolidationRecord, PatternStoreError> {
        let dimensions = self.config.dimensions;
        let patterns = self.repository.list_all().await?;

        let mut centroid = EmbeddingCentroid::new(dimensions);
        centroid.resync(patterns.iter().map(|p| p.context_embedding.as_slice()));
        let mean = centroid.mean();

        let mut estimator = state.estimator.clone();
        estimator.decay(self.config.fisher_decay)?;
        let eligible: Vec<&Pattern> = patterns
            .iter()
            .filter(|p| p.context_embedding.len() == dimensions)
            .collect();
        for index in sample_indices(eligible.len(), self.config.sample_size, self.config.sample_seed) {
            estimator.update(&gradient_from_mean(&eligible[index].context_embedding, &mean))?;
        }

        let scores = score_patterns(&patterns, &estimator, now, &self.config);
        let scored: Vec<(PatternId, f64)> = patterns.iter().map(|p| p.id).zip(scores).collect();
        let plan = plan_pruning(&scored, &self.config);

        let pruned: HashSet<PatternId> = plan.pruned.iter().copied().collect();
        let importance_updates: Vec<ImportanceUpdate> = patterns
            .iter()
            .zip(&scored)
            .filter(|(p, _)| !pruned.contains(&p.id))
            .map(|(p, (_, score))| ImportanceUpdate {
                id: p.id,
                observed: p.importance,
                importance: *score,
            })
            .collect();
        let avg_importance = if importance_updates.is_empty() {
            0.0
        } else {
            importance_updates.iter().map(|u| u.importance).sum::<f64>() / importance_updates.len() as f64
        };

        let record = ConsolidationRecord {
            id: Uuid::new_v4(),
            timestamp: now,
            consolidated: true,
            processed: patterns.len() as u64,
            preserved: plan.preserved,
            pruned: plan.pruned.len() as u64,
            preservation_rate: plan.preservation_rate(),
            duration_ms: started.elapsed().as_millis() as u64,
            avg_importance,
        };

        let commit = ConsolidationCommit {
            importance_updates,
            deletions: plan.pruned.clone(),
            estimator_state: EstimatorState {
                bytes: estimator.serialize().to_vec(),
                update_count: estimator.update_count(),
                last_decay_at: Some(now),
            },
            record: record.clone(),
        };
        self.repository.commit_consolidation(&commit).await?;

        // Committed: swap in the new learning state
        centroid.resync(
            patterns
                .iter()
                .filter(|p| !pruned.contains(&p.id))
                .map(|p| p.context_embedding.as_slice()),
        );
        state.estimator = estimator;
        state.centroid = centroid;
        state.writes_since_consolidation = 0;
        state.last_consolidation_at = Some(now);

        let final_importance: HashMap<PatternId, f64> = scored.into_iter().collect();
        for id in &plan.pruned {
            self.publish(PatternCortexEvent::PatternPruned {
                pattern_id: *id,
                final_importance: final_importance.get(id).copied().unwrap_or(0.0),
                timestamp: now,
            })
            .await;
        }

        let below_target = record.preservation_rate < self.config.target_preservation_rate;
        if below_target {
            warn!(
                preservation_rate = record.preservation_rate,
                target = self.config.target_preservation_rate,
                pruned = record.pruned,
                "Consolidation preservation rate below target"
            );
        }
        if total_after(&record) > self.config.max_patterns {
            warn!(
                remaining = total_after(&record),
                max_patterns = self.config.max_patterns,
                "Store remains over capacity: surviving patterns are above the importance threshold"
            );
        }

        metrics::counter!("pattern_cortex_consolidations_total", "result" => "completed").increment(1);
        metrics::counter!("pattern_cortex_patterns_pruned_total").increment(record.pruned);
        metrics::gauge!("pattern_cortex_preservation_rate").set(record.preservation_rate);
        metrics::histogram!("pattern_cortex_consolidation_duration_ms").record(record.duration_ms as f64);

        info!(
            reason = decision.as_str(),
            processed = record.processed,
            preserved = record.preserved,
            pruned = record.pruned,
            preservation_rate = record.preservation_rate,
            avg_importance = record.avg_importance,
            duration_ms = record.duration_ms,
            "Consolidation completed"
        );

        self.publish(PatternCortexEvent::ConsolidationCompleted {
            record: record.clone(),
            below_target,
        })
        .await;

        Ok(record)
    }

    async fn publish(&self, event: PatternCortexEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish cortex event");
        }
    }
}

fn total_after(record: &ConsolidationRecord) -> u64 {
    record.processed - record.pruned
}

/// Distinct indices into `0..len`, at most `amount` of them
fn sample_indices(len: usize, amount: usize, seed: Option<u64>) -> Vec<usize> {
    let amount = amount.min(len);
    if amount == 0 {
        return Vec::new();
    }
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    rand::seq::index::sample(&mut rng, len, amount).into_vec()
}
