// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Encoder port and the adapter the store talks to.
//!
//! The embedding model is external. [`ContextEncoder`] is the only thing the
//! store knows about it; [`PatternEncoder`] wraps an encoder with the
//! dimensionality check and the vector differences ("gradients") fed to the
//! importance estimator.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::{EncoderError, PatternStoreError, ValidationError};
use super::pattern::RecommendationContext;

/// External embedding function: deterministic for identical input, may fail.
#[async_trait]
pub trait ContextEncoder: Send + Sync {
    async fn encode(&self, context: &RecommendationContext) -> Result<Vec<f32>, EncoderError>;
}

#[derive(Clone)]
pub struct PatternEncoder {
    inner: Arc<dyn ContextEncoder>,
    dimensions: usize,
}

impl PatternEncoder {
    pub fn new(inner: Arc<dyn ContextEncoder>, dimensions: usize) -> Self {
        Self { inner, dimensions }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Encode and verify the vector has exactly D finite components
    pub async fn encode(&self, context: &RecommendationContext) -> Result<Vec<f32>, PatternStoreError> {
        let embedding = self.inner.encode(context).await?;
        self.validate(&embedding)?;
        Ok(embedding)
    }

    pub fn validate(&self, embedding: &[f32]) -> Result<(), ValidationError> {
        if embedding.len() != self.dimensions {
            return Err(ValidationError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(ValidationError::NonFiniteEmbedding);
        }
        Ok(())
    }
}

/// `new - anchor`, used when an observation merges into an existing pattern
pub fn gradient(new: &[f32], anchor: &[f32]) -> Vec<f64> {
    new.iter()
        .zip(anchor)
        .map(|(n, a)| *n as f64 - *a as f64)
        .collect()
}

/// `embedding - mean`, the sensitivity of the space to a new direction
pub fn gradient_from_mean(embedding: &[f32], mean: &[f64]) -> Vec<f64> {
    embedding
        .iter()
        .zip(mean)
        .map(|(x, m)| *x as f64 - m)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEncoder(Vec<f32>);

    #[async_trait]
    impl ContextEncoder for FixedEncoder {
        async fn encode(&self, _context: &RecommendationContext) -> Result<Vec<f32>, EncoderError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenEncoder;

    #[async_trait]
    impl ContextEncoder for BrokenEncoder {
        async fn encode(&self, _context: &RecommendationContext) -> Result<Vec<f32>, EncoderError> {
            Err(EncoderError::Unavailable("model offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_encode_checks_dimensions() {
        let encoder = PatternEncoder::new(Arc::new(FixedEncoder(vec![0.1, 0.2])), 3);
        let err = encoder.encode(&RecommendationContext::new("x")).await.unwrap_err();
        assert!(matches!(
            err,
            PatternStoreError::Validation(ValidationError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_encode_rejects_non_finite() {
        let encoder = PatternEncoder::new(Arc::new(FixedEncoder(vec![0.1, f32::NAN])), 2);
        let err = encoder.encode(&RecommendationContext::new("x")).await.unwrap_err();
        assert!(matches!(err, PatternStoreError::Validation(ValidationError::NonFiniteEmbedding)));
    }

    #[tokio::test]
    async fn test_encoder_failure_propagates() {
        let encoder = PatternEncoder::new(Arc::new(BrokenEncoder), 2);
        let err = encoder.encode(&RecommendationContext::new("x")).await.unwrap_err();
        assert!(matches!(err, PatternStoreError::Encoder(EncoderError::Unavailable(_))));
    }

    #[test]
    fn test_gradients() {
        assert_eq!(gradient(&[1.0, 0.5], &[0.5, 0.5]), vec![0.5, 0.0]);
        assert_eq!(gradient_from_mean(&[1.0, 0.0], &[0.25, 0.25]), vec![0.75, -0.25]);
    }
}
