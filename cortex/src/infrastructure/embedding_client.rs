// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Embedding Client
//!
//! Local [`ContextEncoder`] based on feature hashing. Used for development,
//! tests and deployments without an embedding service; production setups plug
//! a model-backed encoder into the same port.
//!
//! Tokens are lowercased alphanumeric runs from the context text plus
//! `key=value` tokens from scalar context attributes. Each token (and each
//! adjacent word pair, at half weight) is hashed into one of D signed buckets
//! and the result is L2-normalized. Identical contexts always produce
//! identical vectors; contexts sharing vocabulary land close together.
//!
//! Token hashes use BLAKE3, so vectors are stable across builds and
//! toolchains and stay comparable with embeddings already persisted.

use async_trait::async_trait;

use crate::domain::encoder::ContextEncoder;
use crate::domain::errors::{EncoderError, ValidationError};
use crate::domain::pattern::RecommendationContext;

const BIGRAM_WEIGHT: f32 = 0.5;
const DEFAULT_DIMENSIONS: usize = 384;

pub struct HashingEncoder {
    dimensions: usize,
}

impl HashingEncoder {
    pub fn new(dimensions: usize) -> Result<Self, ValidationError> {
        if dimensions == 0 {
            return Err(ValidationError::InvalidConfig(
                "encoder dimensions must be positive".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_tokens(&self, tokens: &[String]) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], token: &str, weight: f32) {
        let hash = token_hash(token);

        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

fn token_hash(token: &str) -> u64 {
    let digest = blake3::hash(token.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word)
}

fn tokenize(context: &RecommendationContext) -> Vec<String> {
    let mut tokens: Vec<String> = context
        .text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    if let Some(attributes) = context.attributes.as_object() {
        // serde_json maps iterate in key order, keeping tokens deterministic
        for (key, value) in attributes {
            let value = match value {
                serde_json::Value::String(s) => s.to_lowercase(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            tokens.push(format!("{}={}", key.to_lowercase(), value));
        }
    }
    tokens
}

#[async_trait]
impl ContextEncoder for HashingEncoder {
    async fn encode(&self, context: &RecommendationContext) -> Result<Vec<f32>, EncoderError> {
        let tokens = tokenize(context);
        if tokens.is_empty() {
            return Err(EncoderError::Failed("context has no encodable tokens".to_string()));
        }
        Ok(self.embed_tokens(&tokens))
    }
}
