// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Pattern Cortex
//!
//! Importance-weighted pattern store for recommendation outcomes. Observed
//! (context, subject, outcome) triples are stored as embeddings, merged when
//! near-identical, ranked by importance-weighted cosine similarity and
//! periodically consolidated: a diagonal Fisher estimate of which embedding
//! dimensions carry past knowledge (EWC++) decides what survives pruning.
//!
//! # Architecture
//!
//! - **domain:** pattern aggregate, importance estimator, similarity and
//!   consolidation policy, repository/encoder/event ports
//! - **application:** [`PatternStore`] facade, consolidation engine and
//!   scheduler, repository factory
//! - **infrastructure:** in-memory and PostgreSQL repositories, hashing
//!   encoder, broadcast event bus, logging setup

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::*;
pub use domain::*;
pub use infrastructure::*;
