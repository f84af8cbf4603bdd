// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: the pattern aggregate, the importance estimator, similarity
//! and consolidation policy, and the ports (encoder, repository) the
//! application layer is written against. No I/O happens here.

pub mod config;
pub mod consolidation;
pub mod encoder;
pub mod errors;
pub mod events;
pub mod importance;
pub mod pattern;
pub mod repository;
pub mod similarity;

pub use config::*;
pub use consolidation::{ConsolidationDecision, ConsolidationRecord};
pub use encoder::{ContextEncoder, PatternEncoder};
pub use errors::{EncoderError, EstimatorError, PatternStoreError, ValidationError};
pub use events::*;
pub use importance::{EmbeddingCentroid, ImportanceEstimator};
pub use pattern::*;
pub use repository::*;
pub use similarity::SimilarPattern;
