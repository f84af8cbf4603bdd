// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Error taxonomy for the pattern cortex.
//!
//! Validation and encoder failures are raised before any state is touched.
//! Persistence failures leave the store in its prior consistent state.
//! Consistency warnings (e.g. a failed access-count update after a successful
//! read) are logged and never appear here.

use super::pattern::PatternId;
use super::repository::RepositoryError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown outcome kind: {0}")]
    UnknownOutcomeKind(String),

    #[error("Outcome confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding contains non-finite components")]
    NonFiniteEmbedding,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure reported by the external context encoder
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Encoder unavailable: {0}")]
    Unavailable(String),

    #[error("Encoding failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EstimatorError {
    #[error("Gradient dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Gradient contains non-finite components")]
    NonFiniteGradient,

    #[error("Decay factor must be within (0, 1), got {0}")]
    InvalidDecayFactor(f64),

    #[error("Serialized estimator has {actual} bytes, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Serialized estimator is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PatternStoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error(transparent)]
    Persistence(#[from] RepositoryError),

    #[error(transparent)]
    Estimator(#[from] EstimatorError),

    #[error("Pattern not found: {0}")]
    NotFound(PatternId),
}

pub type Result<T, E = PatternStoreError> = std::result::Result<T, E>;
