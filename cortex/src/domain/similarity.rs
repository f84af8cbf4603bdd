// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Similarity ranking over pattern embeddings.
//!
//! Pure functions, no I/O. All arithmetic runs in f64 over f32 inputs.
//! Zero vectors and length mismatches score 0 instead of dividing by zero.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::pattern::Pattern;

/// Plain cosine similarity
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Importance-weighted cosine similarity.
///
/// Each dimension's contribution is weighted by `1 + importance[i]`, both in
/// the dot product and in the two norms, so agreement on load-bearing
/// dimensions dominates the score.
pub fn weighted_cosine(a: &[f32], b: &[f32], importance: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() != importance.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for ((x, y), w) in a.iter().zip(b).zip(importance) {
        let (x, y) = (*x as f64, *y as f64);
        let w = 1.0 + w.max(0.0);
        dot += w * x * y;
        norm_a += w * x * x;
        norm_b += w * y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// A pattern scored against a query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarPattern {
    pub pattern: Pattern,
    pub similarity: f64,
    pub weighted_similarity: f64,
    /// 1-based position in the ranking
    pub rank: usize,
}

/// Score every candidate against the query, order by weighted similarity
/// (descending) and keep the top `limit`.
pub fn rank(
    query: &[f32],
    candidates: Vec<Pattern>,
    importance: &[f64],
    limit: usize,
) -> Vec<SimilarPattern> {
    let mut scored: Vec<SimilarPattern> = candidates
        .into_iter()
        .map(|pattern| {
            let similarity = cosine(query, &pattern.context_embedding);
            let weighted_similarity = weighted_cosine(query, &pattern.context_embedding, importance);
            SimilarPattern {
                pattern,
                similarity,
                weighted_similarity,
                rank: 0,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.weighted_similarity
            .partial_cmp(&a.weighted_similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal))
    });
    scored.truncate(limit);

    for (i, entry) in scored.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    scored
}

/// Best plain-cosine match among the candidates, if any
pub fn best_match<'a>(query: &[f32], candidates: &'a [Pattern]) -> Option<(&'a Pattern, f64)> {
    candidates
        .iter()
        .map(|p| (p, cosine(query, &p.context_embedding)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
}
