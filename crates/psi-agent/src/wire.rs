//! Wire: process-local pub/sub fan-out of loop events
//!
//! Publication is non-blocking; each subscriber owns a bounded buffer and
//! a slow subscriber loses the oldest events rather than blocking the
//! publisher. The wire has no persistence.

use tokio::sync::broadcast;

use crate::events::SoulEvent;

/// Default per-subscriber buffer capacity
const DEFAULT_CAPACITY: usize = 256;

/// Multicast channel for [`SoulEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct Wire {
    tx: broadcast::Sender<SoulEvent>,
}

impl Wire {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a wire with a specific per-subscriber buffer capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Never blocks; an event published with no subscribers is dropped.
    pub fn publish(&self, event: SoulEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call.
    ///
    /// Dropping the returned subscription cancels it.
    pub fn subscribe(&self) -> WireSubscription {
        WireSubscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's end of the wire
pub struct WireSubscription {
    rx: broadcast::Receiver<SoulEvent>,
    dropped: u64,
}

impl WireSubscription {
    /// Receive the next event, or `None` once every publisher is gone.
    ///
    /// When this subscriber lags behind its buffer the oldest events are
    /// discarded; the loss is recorded in [`Self::dropped`] and reception
    /// resumes at the oldest retained event.
    pub async fn recv(&mut self) -> Option<SoulEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::warn!("wire subscriber lagged, dropped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive without waiting; `None` when no event is ready.
    pub fn try_recv(&mut self) -> Option<SoulEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::warn!("wire subscriber lagged, dropped {n} events");
                }
                Err(_) => return None,
            }
        }
    }

    /// Total events lost to buffer overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u32) -> SoulEvent {
        SoulEvent::StepBegin { step: n }
    }

    #[tokio::test]
    async fn test_multicast_to_all_subscribers() {
        let wire = Wire::new();
        let mut a = wire.subscribe();
        let mut b = wire.subscribe();

        wire.publish(step(1));
        wire.publish(SoulEvent::StepEnd);

        for sub in [&mut a, &mut b] {
            assert!(matches!(sub.recv().await, Some(SoulEvent::StepBegin { step: 1 })));
            assert!(matches!(sub.recv().await, Some(SoulEvent::StepEnd)));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let wire = Wire::new();
        wire.publish(step(1));
        assert_eq!(wire.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let wire = Wire::new();
        let mut sub = wire.subscribe();
        for n in 1..=10 {
            wire.publish(step(n));
        }
        for n in 1..=10 {
            match sub.recv().await {
                Some(SoulEvent::StepBegin { step }) => assert_eq!(step, n),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let wire = Wire::with_capacity(4);
        let mut sub = wire.subscribe();
        for n in 1..=10 {
            wire.publish(step(n));
        }
        // the first events are gone; reception resumes at the oldest retained
        let first = sub.recv().await.unwrap();
        assert!(matches!(first, SoulEvent::StepBegin { step } if step > 1));
        assert!(sub.dropped() > 0);
    }

    #[tokio::test]
    async fn test_closed_after_all_publishers_dropped() {
        let wire = Wire::new();
        let mut sub = wire.subscribe();
        wire.publish(step(1));
        drop(wire);
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
