// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure layer for the pattern cortex

pub mod db;
pub mod embedding_client;
pub mod event_bus;
pub mod in_memory_repository;
pub mod logging;
pub mod postgres_repository;

pub use db::Database;
pub use embedding_client::HashingEncoder;
pub use event_bus::{BroadcastEventBus, EventBusError, EventReceiver, NoopEventBus};
pub use in_memory_repository::InMemoryPatternRepository;
pub use logging::{init_logging, LogFormat};
pub use postgres_repository::PostgresPatternRepository;
