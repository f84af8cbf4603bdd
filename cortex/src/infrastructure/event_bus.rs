// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for cortex events
//
// In-memory fan-out over a tokio broadcast channel. Events are dropped when
// nobody is subscribed; slow subscribers lag and lose the oldest events.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{EventBus, PatternCortexEvent};

#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: Arc<broadcast::Sender<PatternCortexEvent>>,
}

impl BroadcastEventBus {
    /// Capacity is the number of buffered events before old ones are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: PatternCortexEvent) -> anyhow::Result<()> {
        debug!(event_type = event.event_type(), "Publishing cortex event");

        // send() only fails when there are no receivers
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
        Ok(())
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<PatternCortexEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<PatternCortexEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<PatternCortexEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => EventBusError::Lagged(n),
        })
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventBus;

#[async_trait]
impl EventBus for NoopEventBus {
    async fn publish(&self, _event: PatternCortexEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus closed")]
    Closed,

    #[error("Receiver lagged by {0} events")]
    Lagged(u64),

    #[error("No events available")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pattern::PatternId;
    use chrono::Utc;

    fn pruned_event() -> PatternCortexEvent {
        PatternCortexEvent::PatternPruned {
            pattern_id: PatternId::new(),
            final_importance: 0.001,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = BroadcastEventBus::new(16);
        let mut receiver = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(pruned_event()).await.unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "pattern_pruned");
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::with_default_capacity();
        assert!(bus.publish(pruned_event()).await.is_ok());
        assert!(NoopEventBus.publish(pruned_event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagged_receiver() {
        let bus = BroadcastEventBus::new(2);
        let mut receiver = bus.subscribe();
        for _ in 0..5 {
            bus.publish(pruned_event()).await.unwrap();
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Lagged(_))));
    }
}
