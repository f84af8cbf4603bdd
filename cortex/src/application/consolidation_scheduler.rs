// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Consolidation Scheduler - background task driving the sleep cycle
//!
//! Runs [`PatternStore::consolidate`] on a fixed interval and whenever the
//! store signals demand (`consolidation_mode: background`). The scheduler
//! holds only a weak reference to the store and stops when the store is
//! dropped, when [`PatternStore::close`] is called, or when its cancellation
//! token fires.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pattern_store::PatternStore;

pub struct ConsolidationScheduler {
    store: Weak<PatternStore>,
    signal: Arc<Notify>,
    interval: Option<Duration>,
    shutdown_token: CancellationToken,
}

impl ConsolidationScheduler {
    /// Build a scheduler for `store` using its configured interval and
    /// register it so that closing the store stops the task.
    pub fn new(store: &Arc<PatternStore>) -> Self {
        let shutdown_token = CancellationToken::new();
        store.attach_scheduler(shutdown_token.clone());
        Self {
            store: Arc::downgrade(store),
            signal: store.consolidation_signal(),
            interval: store.config().scheduler_interval,
            shutdown_token,
        }
    }

    /// Override the tick interval (`None` = signal-driven only)
    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the scheduler background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            interval_seconds = self.interval.map(|d| d.as_secs()),
            "Starting consolidation scheduler"
        );

        let mut tick = self.interval.map(|period| {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        loop {
            tokio::select! {
                _ = next_tick(&mut tick) => {
                    debug!("Scheduled consolidation tick");
                }
                _ = self.signal.notified() => {
                    debug!("Consolidation requested by store");
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping consolidation scheduler");
                    break;
                }
            }

            if !self.run_cycle().await {
                break;
            }
        }

        info!("Consolidation scheduler stopped");
    }

    /// One consolidation attempt. Returns false once the store is gone.
    async fn run_cycle(&self) -> bool {
        let Some(store) = self.store.upgrade() else {
            debug!("Pattern store dropped");
            return false;
        };

        match store.consolidate().await {
            Ok(record) if record.consolidated => {
                info!(
                    processed = record.processed,
                    pruned = record.pruned,
                    preservation_rate = record.preservation_rate,
                    "Scheduled consolidation completed"
                );
            }
            Ok(_) => debug!("Scheduled consolidation not due"),
            Err(e) => warn!("Scheduled consolidation failed: {}", e),
        }
        true
    }
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::{ConsolidationMode, PatternStoreConfig};
    use crate::domain::encoder::ContextEncoder;
    use crate::domain::errors::EncoderError;
    use crate::domain::pattern::{Outcome, OutcomeKind, PatternInput, RecommendationContext};
    use crate::domain::repository::PatternRepository;
    use crate::infrastructure::event_bus::NoopEventBus;
    use crate::infrastructure::in_memory_repository::InMemoryPatternRepository;
    use async_trait::async_trait;

    struct AxisEncoder;

    #[async_trait]
    impl ContextEncoder for AxisEncoder {
        async fn encode(&self, context: &RecommendationContext) -> Result<Vec<f32>, EncoderError> {
            let axis = context.text.len() % 4;
            let mut v = vec![0.0; 4];
            v[axis] = 1.0;
            Ok(v)
        }
    }

    async fn open(mode: ConsolidationMode) -> (Arc<PatternStore>, Arc<InMemoryPatternRepository>) {
        let config = PatternStoreConfig {
            dimensions: 4,
            consolidation_mode: mode,
            min_consolidation_interval: Duration::ZERO,
            scheduler_interval: None,
            ..PatternStoreConfig::default()
        };
        let repo = Arc::new(InMemoryPatternRepository::new());
        let store = PatternStore::open(config, repo.clone(), Arc::new(AxisEncoder), Arc::new(NoopEventBus))
            .await
            .unwrap();
        (Arc::new(store), repo)
    }

    async fn wait_for_history(repo: &InMemoryPatternRepository) -> usize {
        for _ in 0..100 {
            let runs = repo.consolidation_history(10).await.unwrap().len();
            if runs > 0 {
                return runs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    #[tokio::test]
    async fn test_signal_triggers_consolidation() {
        let (store, repo) = open(ConsolidationMode::Background).await;
        let scheduler = Arc::new(ConsolidationScheduler::new(&store));
        let handle = scheduler.start();

        store
            .store_pattern(
                PatternInput::new(RecommendationContext::new("abc"), "skill-a"),
                Outcome::new(OutcomeKind::Accept),
            )
            .await
            .unwrap();

        assert_eq!(wait_for_history(&repo).await, 1);

        store.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interval_triggers_consolidation() {
        let (store, repo) = open(ConsolidationMode::Manual).await;
        store
            .store_pattern(
                PatternInput::new(RecommendationContext::new("abcd"), "skill-a"),
                Outcome::new(OutcomeKind::Usage),
            )
            .await
            .unwrap();

        let scheduler = Arc::new(ConsolidationScheduler::new(&store).with_interval(Some(Duration::from_millis(20))));
        let token = scheduler.shutdown_token();
        let handle = scheduler.start();

        assert_eq!(wait_for_history(&repo).await, 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_stops_when_store_dropped() {
        let (store, _) = open(ConsolidationMode::Background).await;
        let scheduler = Arc::new(ConsolidationScheduler::new(&store).with_interval(Some(Duration::from_millis(10))));
        let handle = scheduler.start();

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
