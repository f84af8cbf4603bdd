// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Importance Estimator (diagonal Fisher information)
//!
//! Online running-mean-of-squared-gradient estimate of how load-bearing each
//! embedding dimension is:
//!
//! ```text
//! running_sum[i] += g[i]^2        (update)
//! running_sum[i] *= factor        (decay, update_count untouched)
//! importance[i]   = running_sum[i] / max(1, update_count)
//! ```
//!
//! The estimator is a plain owned value. The store keeps exactly one instance
//! behind its single-writer lock and hands readers owned copies of the
//! importance vector, never a reference into the live buffers.
//!
//! ## Binary layout
//!
//! Little-endian, fixed, unversioned:
//! `[u32 update_count][D x f64 running_sum][D x f64 importance]`.
//! The importance buffer is written for readers of the raw row; on load it is
//! validated and then re-derived from `running_sum`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::errors::EstimatorError;

const COUNT_BYTES: usize = 4;
const VALUE_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceEstimator {
    running_sum: Vec<f64>,
    importance: Vec<f64>,
    update_count: u32,
}

impl ImportanceEstimator {
    pub fn new(dimensions: usize) -> Self {
        Self {
            running_sum: vec![0.0; dimensions],
            importance: vec![0.0; dimensions],
            update_count: 0,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.running_sum.len()
    }

    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    /// Fold one gradient observation into the running sums.
    pub fn update(&mut self, gradient: &[f64]) -> Result<(), EstimatorError> {
        if gradient.len() != self.dimensions() {
            return Err(EstimatorError::DimensionMismatch {
                expected: self.dimensions(),
                actual: gradient.len(),
            });
        }
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(EstimatorError::NonFiniteGradient);
        }

        for (sum, g) in self.running_sum.iter_mut().zip(gradient) {
            *sum += g * g;
        }
        self.update_count = self.update_count.saturating_add(1);
        self.recompute();
        Ok(())
    }

    /// Scale the accumulated sums down without forgetting how many
    /// observations were made.
    pub fn decay(&mut self, factor: f64) -> Result<(), EstimatorError> {
        if !(factor > 0.0 && factor < 1.0) {
            return Err(EstimatorError::InvalidDecayFactor(factor));
        }
        for sum in &mut self.running_sum {
            *sum *= factor;
        }
        self.recompute();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.running_sum.iter_mut().for_each(|v| *v = 0.0);
        self.importance.iter_mut().for_each(|v| *v = 0.0);
        self.update_count = 0;
    }

    pub fn average_importance(&self) -> f64 {
        if self.importance.is_empty() {
            return 0.0;
        }
        self.importance.iter().sum::<f64>() / self.importance.len() as f64
    }

    /// Owned copy of the importance vector
    pub fn importance_vector(&self) -> Vec<f64> {
        self.importance.clone()
    }

    /// Mean over dimensions of `importance[i] * |embedding[i]|`: how much of a
    /// vector's mass sits in historically load-bearing dimensions.
    pub fn alignment(&self, embedding: &[f32]) -> f64 {
        if embedding.len() != self.dimensions() || embedding.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .importance
            .iter()
            .zip(embedding)
            .map(|(w, x)| w * (*x as f64).abs())
            .sum();
        total / embedding.len() as f64
    }

    pub fn serialized_len(dimensions: usize) -> usize {
        COUNT_BYTES + 2 * dimensions * VALUE_BYTES
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::serialized_len(self.dimensions()));
        buf.put_u32_le(self.update_count);
        for v in &self.running_sum {
            buf.put_f64_le(*v);
        }
        for v in &self.importance {
            buf.put_f64_le(*v);
        }
        buf.freeze()
    }

    pub fn deserialize(bytes: &[u8], dimensions: usize) -> Result<Self, EstimatorError> {
        let expected = Self::serialized_len(dimensions);
        if bytes.len() != expected {
            return Err(EstimatorError::InvalidLength {
                expected,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let update_count = buf.get_u32_le();
        let mut running_sum = Vec::with_capacity(dimensions);
        for i in 0..dimensions {
            let v = buf.get_f64_le();
            if !v.is_finite() || v < 0.0 {
                return Err(EstimatorError::Corrupt(format!("running_sum[{}] = {}", i, v)));
            }
            running_sum.push(v);
        }
        for i in 0..dimensions {
            let v = buf.get_f64_le();
            if !v.is_finite() || v < 0.0 {
                return Err(EstimatorError::Corrupt(format!("importance[{}] = {}", i, v)));
            }
        }

        let mut estimator = Self {
            running_sum,
            importance: vec![0.0; dimensions],
            update_count,
        };
        estimator.recompute();
        Ok(estimator)
    }

    fn recompute(&mut self) {
        let denominator = self.update_count.max(1) as f64;
        for (imp, sum) in self.importance.iter_mut().zip(&self.running_sum) {
            *imp = sum / denominator;
        }
    }
}

/// Running mean of every stored embedding.
///
/// Maintained incrementally on insert (O(1) per dimension) and resynchronized
/// exactly from the full pattern set during consolidation, which bounds the
/// floating-point drift of the incremental form.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingCentroid {
    sum: Vec<f64>,
    count: u64,
}

impl EmbeddingCentroid {
    pub fn new(dimensions: usize) -> Self {
        Self {
            sum: vec![0.0; dimensions],
            count: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, embedding: &[f32]) {
        if embedding.len() != self.sum.len() {
            return;
        }
        for (s, x) in self.sum.iter_mut().zip(embedding) {
            *s += *x as f64;
        }
        self.count += 1;
    }

    /// Mean embedding; the zero vector for an empty store
    pub fn mean(&self) -> Vec<f64> {
        if self.count == 0 {
            return vec![0.0; self.sum.len()];
        }
        let n = self.count as f64;
        self.sum.iter().map(|s| s / n).collect()
    }

    /// Recompute exactly from the given embeddings
    pub fn resync<'a, I>(&mut self, embeddings: I)
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        self.sum.iter_mut().for_each(|s| *s = 0.0);
        self.count = 0;
        for embedding in embeddings {
            self.add(embedding);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_is_running_mean_of_squares() {
        let mut estimator = ImportanceEstimator::new(3);
        estimator.update(&[1.0, 2.0, 0.0]).unwrap();
        estimator.update(&[3.0, 0.0, 0.0]).unwrap();

        assert_eq!(estimator.update_count(), 2);
        assert_eq!(estimator.importance_vector(), vec![5.0, 2.0, 0.0]);
        assert!((estimator.average_importance() - 7.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_update_rejects_wrong_dimension() {
        let mut estimator = ImportanceEstimator::new(3);
        let err = estimator.update(&[1.0, 2.0]).unwrap_err();
        assert_eq!(err, EstimatorError::DimensionMismatch { expected: 3, actual: 2 });
        assert_eq!(estimator.update_count(), 0);
    }

    #[test]
    fn test_update_rejects_non_finite_gradient() {
        let mut estimator = ImportanceEstimator::new(2);
        assert!(estimator.update(&[f64::NAN, 0.0]).is_err());
        assert_eq!(estimator.average_importance(), 0.0);
    }

    #[test]
    fn test_decay_is_monotone_and_keeps_count() {
        let mut estimator = ImportanceEstimator::new(4);
        estimator.update(&[0.5, -1.0, 2.0, 0.0]).unwrap();
        estimator.update(&[0.1, 0.3, -0.7, 0.0]).unwrap();
        let before = estimator.importance_vector();

        estimator.decay(0.95).unwrap();
        let after = estimator.importance_vector();

        assert_eq!(estimator.update_count(), 2);
        for (b, a) in before.iter().zip(&after) {
            assert!(a <= b);
            assert!(*a >= 0.0);
        }
        assert!((after[2] - before[2] * 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_decay_rejects_out_of_range_factor() {
        let mut estimator = ImportanceEstimator::new(2);
        for factor in [0.0, 1.0, 1.5, -0.2, f64::NAN] {
            assert!(estimator.decay(factor).is_err());
        }
    }

    #[test]
    fn test_reset_zeroes_average() {
        let mut estimator = ImportanceEstimator::new(2);
        estimator.update(&[3.0, 4.0]).unwrap();
        estimator.reset();
        assert_eq!(estimator.average_importance(), 0.0);
        assert_eq!(estimator.update_count(), 0);
    }

    #[test]
    fn test_importance_vector_is_a_copy() {
        let mut estimator = ImportanceEstimator::new(2);
        estimator.update(&[1.0, 1.0]).unwrap();
        let mut copy = estimator.importance_vector();
        copy[0] = 100.0;
        assert_eq!(estimator.importance_vector(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_serialized_layout() {
        let mut estimator = ImportanceEstimator::new(2);
        estimator.update(&[2.0, 1.0]).unwrap();
        estimator.update(&[0.0, 1.0]).unwrap();
        estimator.decay(0.5).unwrap();

        let bytes = estimator.serialize();
        assert_eq!(bytes.len(), ImportanceEstimator::serialized_len(2));
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..12], &2.0f64.to_le_bytes());

        let restored = ImportanceEstimator::deserialize(&bytes, 2).unwrap();
        assert_eq!(restored, estimator);
    }

    #[test]
    fn test_deserialize_rejects_bad_input() {
        let estimator = ImportanceEstimator::new(4);
        let bytes = estimator.serialize();
        assert!(matches!(
            ImportanceEstimator::deserialize(&bytes, 3),
            Err(EstimatorError::InvalidLength { .. })
        ));

        let mut corrupt = bytes.to_vec();
        corrupt[4..12].copy_from_slice(&(-1.0f64).to_le_bytes());
        assert!(matches!(
            ImportanceEstimator::deserialize(&corrupt, 4),
            Err(EstimatorError::Corrupt(_))
        ));
    }

    #[test]
    fn test_alignment_prefers_important_dimensions() {
        let mut estimator = ImportanceEstimator::new(2);
        estimator.update(&[2.0, 0.1]).unwrap();
        let on_important = estimator.alignment(&[1.0, 0.0]);
        let on_unimportant = estimator.alignment(&[0.0, 1.0]);
        assert!(on_important > on_unimportant);
    }

    #[test]
    fn test_centroid_incremental_matches_resync() {
        let vectors: Vec<Vec<f32>> = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]];
        let mut incremental = EmbeddingCentroid::new(2);
        for v in &vectors {
            incremental.add(v);
        }
        let mut exact = EmbeddingCentroid::new(2);
        exact.resync(vectors.iter().map(|v| v.as_slice()));

        assert_eq!(incremental.len(), 3);
        assert_eq!(incremental.mean(), exact.mean());
        assert!((exact.mean()[0] - 0.5).abs() < 1e-12);
        assert_eq!(EmbeddingCentroid::new(2).mean(), vec![0.0, 0.0]);
    }
}
