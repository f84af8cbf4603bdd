// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain events for the pattern cortex
//! Published to the EventBus for observability and integration

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::consolidation::ConsolidationRecord;
use super::pattern::{OutcomeKind, PatternId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternCortexEvent {
    /// A new pattern was stored
    PatternDiscovered {
        pattern_id: PatternId,
        subject_id: String,
        outcome_kind: OutcomeKind,
        initial_importance: f64,
        timestamp: DateTime<Utc>,
    },

    /// A near-duplicate observation merged into an existing pattern
    PatternReinforced {
        pattern_id: PatternId,
        similarity: f64,
        old_importance: f64,
        new_importance: f64,
        access_count: u64,
        timestamp: DateTime<Utc>,
    },

    /// Pattern was pruned during consolidation
    PatternPruned {
        pattern_id: PatternId,
        final_importance: f64,
        timestamp: DateTime<Utc>,
    },

    ConsolidationCompleted {
        record: ConsolidationRecord,
        below_target: bool,
    },

    ConsolidationSkipped {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl PatternCortexEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PatternCortexEvent::PatternDiscovered { timestamp, .. } => *timestamp,
            PatternCortexEvent::PatternReinforced { timestamp, .. } => *timestamp,
            PatternCortexEvent::PatternPruned { timestamp, .. } => *timestamp,
            PatternCortexEvent::ConsolidationCompleted { record, .. } => record.timestamp,
            PatternCortexEvent::ConsolidationSkipped { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            PatternCortexEvent::PatternDiscovered { .. } => "pattern_discovered",
            PatternCortexEvent::PatternReinforced { .. } => "pattern_reinforced",
            PatternCortexEvent::PatternPruned { .. } => "pattern_pruned",
            PatternCortexEvent::ConsolidationCompleted { .. } => "consolidation_completed",
            PatternCortexEvent::ConsolidationSkipped { .. } => "consolidation_skipped",
        }
    }
}

/// Sink for cortex events. Publishing failures are logged by the caller and
/// never fail the operation that produced the event.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: PatternCortexEvent) -> anyhow::Result<()>;
}
