// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Application layer: the pattern store facade, consolidation orchestration
//! and the background scheduler.

pub mod consolidation_engine;
pub mod consolidation_scheduler;
pub mod pattern_store;
pub mod repository_factory;

pub use consolidation_engine::{ConsolidationEngine, LearningState};
pub use consolidation_scheduler::ConsolidationScheduler;
pub use pattern_store::{ConsolidationSummary, LearningSnapshot, PatternStore, PatternStoreMetrics};
pub use repository_factory::{create_pattern_repository, open_pattern_store};
