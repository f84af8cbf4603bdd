// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Pattern Aggregate
//!
//! A [`Pattern`] is one observed (context, recommended subject, outcome)
//! triple. The context is stored only as its embedding; the subject is an
//! opaque identifier plus a verbatim JSON feature record.
//!
//! Outcome kinds form a closed set. Every kind maps to a fixed signed reward
//! through an exhaustive `match`, so an unknown kind can only ever fail at the
//! parsing boundary ([`OutcomeKind::from_str`] / serde) and never reach storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(pub Uuid);

impl PatternId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome reported by the upstream recommender for a recommended subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Accept,
    Usage,
    Frequent,
    Dismiss,
    Abandonment,
    Uninstall,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 6] = [
        OutcomeKind::Accept,
        OutcomeKind::Usage,
        OutcomeKind::Frequent,
        OutcomeKind::Dismiss,
        OutcomeKind::Abandonment,
        OutcomeKind::Uninstall,
    ];

    /// Signed reward in [-1.0, 1.0]
    pub fn reward(self) -> f64 {
        match self {
            OutcomeKind::Accept => 1.0,
            OutcomeKind::Frequent => 0.5,
            OutcomeKind::Usage => 0.3,
            OutcomeKind::Dismiss => -0.5,
            OutcomeKind::Abandonment => -0.3,
            OutcomeKind::Uninstall => -0.7,
        }
    }

    pub fn is_positive(self) -> bool {
        self.reward() > 0.0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Accept => "accept",
            OutcomeKind::Usage => "usage",
            OutcomeKind::Frequent => "frequent",
            OutcomeKind::Dismiss => "dismiss",
            OutcomeKind::Abandonment => "abandonment",
            OutcomeKind::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(OutcomeKind::Accept),
            "usage" => Ok(OutcomeKind::Usage),
            "frequent" => Ok(OutcomeKind::Frequent),
            "dismiss" => Ok(OutcomeKind::Dismiss),
            "abandonment" => Ok(OutcomeKind::Abandonment),
            "uninstall" => Ok(OutcomeKind::Uninstall),
            other => Err(ValidationError::UnknownOutcomeKind(other.to_string())),
        }
    }
}

/// Outcome report accompanying a stored pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// Upstream confidence in the report, in [0, 1]. Treated as 1.0 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Outcome {
    pub fn new(kind: OutcomeKind) -> Self {
        Self { kind, confidence: None }
    }

    pub fn with_confidence(kind: OutcomeKind, confidence: f64) -> Self {
        Self { kind, confidence: Some(confidence) }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(confidence) = self.confidence {
            if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
                return Err(ValidationError::InvalidConfidence(confidence));
            }
        }
        Ok(())
    }

    /// Unscaled importance a fresh observation of this outcome carries:
    /// `|reward|`, boosted by half again for positive outcomes, times confidence.
    pub fn base_importance(&self) -> f64 {
        let reward = self.kind.reward();
        let mut base = reward.abs();
        if reward > 0.0 {
            base *= 1.5;
        }
        base * self.confidence.unwrap_or(1.0)
    }
}

/// Recommendation context handed to the encoder. Opaque to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationContext {
    pub text: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl RecommendationContext {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Feature record describing the recommended subject, stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectFeatures(pub serde_json::Value);

impl SubjectFeatures {
    pub fn category(&self) -> Option<&str> {
        self.0.get("category").and_then(|c| c.as_str())
    }
}

/// Caller input for `store_pattern`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternInput {
    pub context: RecommendationContext,
    pub subject_id: String,
    #[serde(default)]
    pub subject_features: SubjectFeatures,
}

impl PatternInput {
    pub fn new(context: RecommendationContext, subject_id: impl Into<String>) -> Self {
        Self {
            context,
            subject_id: subject_id.into(),
            subject_features: SubjectFeatures::default(),
        }
    }

    pub fn with_features(mut self, features: serde_json::Value) -> Self {
        self.subject_features = SubjectFeatures(features);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub context_embedding: Vec<f32>,
    pub subject_id: String,
    pub subject_features: SubjectFeatures,
    pub outcome_kind: OutcomeKind,
    pub reward: f64,
    pub importance: f64,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl Pattern {
    pub fn new(
        context_embedding: Vec<f32>,
        subject_id: String,
        subject_features: SubjectFeatures,
        outcome_kind: OutcomeKind,
        importance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PatternId::new(),
            context_embedding,
            subject_id,
            subject_features,
            outcome_kind,
            reward: outcome_kind.reward(),
            importance: importance.max(0.0),
            access_count: 0,
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Reinforce after a near-duplicate observation. The embedding is left
    /// untouched; it anchors the cluster.
    pub fn reinforce(&mut self, importance_delta: f64, at: DateTime<Utc>) {
        self.importance = (self.importance + importance_delta).max(0.0);
        self.access_count += 1;
        self.last_accessed_at = at;
    }

    /// Read-match bookkeeping
    pub fn record_access(&mut self, importance_boost: f64, at: DateTime<Utc>) {
        self.reinforce(importance_boost, at);
    }

    pub fn is_positive(&self) -> bool {
        self.reward > 0.0
    }
}
