// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory
//!
//! Creates the concrete [`PatternRepository`] for the configured
//! [`StorageBackend`] and wires a [`PatternStore`] on top of it.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::pattern_store::PatternStore;
use crate::domain::config::{PatternStoreConfig, StorageBackend};
use crate::domain::encoder::ContextEncoder;
use crate::domain::events::EventBus;
use crate::domain::repository::PatternRepository;
use crate::infrastructure::db::Database;
use crate::infrastructure::in_memory_repository::InMemoryPatternRepository;
use crate::infrastructure::postgres_repository::PostgresPatternRepository;

/// Creates a PatternRepository implementation based on the configured backend.
/// The Postgres schema is created if missing.
pub async fn create_pattern_repository(backend: &StorageBackend) -> Result<Arc<dyn PatternRepository>> {
    match backend {
        StorageBackend::InMemory => Ok(Arc::new(InMemoryPatternRepository::new())),
        StorageBackend::Postgres { connection_string } => {
            let db = Database::new(connection_string)
                .await
                .context("Failed to connect to pattern cortex database")?;
            let repository = PostgresPatternRepository::new(db.get_pool().clone());
            repository
                .initialize()
                .await
                .context("Failed to initialize pattern cortex schema")?;
            Ok(Arc::new(repository))
        }
    }
}

/// Build a store from configuration alone
pub async fn open_pattern_store(
    config: PatternStoreConfig,
    encoder: Arc<dyn ContextEncoder>,
    event_bus: Arc<dyn EventBus>,
) -> Result<PatternStore> {
    let repository = create_pattern_repository(&config.storage).await?;
    let store = PatternStore::open(config, repository, encoder, event_bus)
        .await
        .context("Failed to open pattern store")?;
    Ok(store)
}
