//! Fan-out of routed events to client queues.
//!
//! Delivery is isolated per target: a full or closed queue on one client is
//! logged and dealt with, and the loop moves on to the next target.

use crate::handle::SendFailure;
use crate::registry::{ClientId, ClientRecord, ClientRegistry};
use crate::router::Delivery;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default number of consecutive full-queue failures before a client is
/// treated as dead.
pub const DEFAULT_MAX_STRIKES: u32 = 8;

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Consecutive full-queue failures tolerated before eviction.
    pub max_strikes: u32,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            max_strikes: DEFAULT_MAX_STRIKES,
        }
    }
}

/// Outcome of one [`Broadcaster::deliver`] call.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Events enqueued.
    pub delivered: usize,
    /// Targets that were already gone when delivery happened.
    pub skipped: usize,
    /// Events dropped because the target's queue was full.
    pub dropped: usize,
    /// Clients unregistered because their queue was closed or persistently
    /// full.
    pub evicted: Vec<ClientRecord>,
}

impl DeliveryReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
        self.evicted.extend(other.evicted);
    }

    /// Ids of the evicted clients.
    #[must_use]
    pub fn evicted_ids(&self) -> Vec<ClientId> {
        self.evicted.iter().map(|record| record.id).collect()
    }
}

/// Pushes deliveries onto client queues.
pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
    /// Consecutive full-queue failures per client.
    strikes: DashMap<ClientId, u32>,
    config: BroadcasterConfig,
}

impl Broadcaster {
    /// Create a broadcaster over the given registry.
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry>, config: BroadcasterConfig) -> Self {
        Self {
            registry,
            strikes: DashMap::new(),
            config,
        }
    }

    /// Deliver every event to its target.
    ///
    /// The target's handle is looked up at delivery time, so a client that
    /// left after routing is simply skipped.
    pub fn deliver(&self, deliveries: Vec<Delivery>) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for Delivery { target, event } in deliveries {
            let Some(handle) = self.registry.handle(target) else {
                trace!(client = %target, event = event.kind(), "Target gone, skipping");
                report.skipped += 1;
                continue;
            };

            match handle.try_deliver(event) {
                Ok(()) => {
                    self.strikes.remove(&target);
                    report.delivered += 1;
                }
                Err(SendFailure::Closed) => {
                    debug!(client = %target, "Outbound queue closed");
                    self.evict(target, &mut report);
                }
                Err(SendFailure::Full) => {
                    report.dropped += 1;
                    let strikes = {
                        let mut entry = self.strikes.entry(target).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    if !self.registry.contains(target) {
                        // Left between lookup and strike; `forget` may already have run.
                        self.strikes.remove(&target);
                        continue;
                    }
                    warn!(
                        client = %target,
                        strikes,
                        max_strikes = self.config.max_strikes,
                        "Outbound queue full, event dropped"
                    );
                    if strikes >= self.config.max_strikes {
                        self.evict(target, &mut report);
                    }
                }
            }
        }

        report
    }

    /// Forget per-client bookkeeping for a departed client.
    pub fn forget(&self, id: ClientId) {
        self.strikes.remove(&id);
    }

    /// Current strike count for a client.
    #[must_use]
    pub fn strikes(&self, id: ClientId) -> u32 {
        self.strikes.get(&id).map(|s| *s).unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.strikes.len()
    }

    fn evict(&self, target: ClientId, report: &mut DeliveryReport) {
        self.strikes.remove(&target);
        if let Some(record) = self.registry.unregister(target) {
            warn!(client = %target, name = %record.name, "Evicting unreachable client");
            report.evicted.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{OutboundReceiver, SendHandle};
    use murmur_protocol::Event;

    fn event(text: &str) -> Arc<Event> {
        Arc::new(Event::system(text))
    }

    fn broadcast_all(registry: &ClientRegistry, text: &str) -> Vec<Delivery> {
        let event = event(text);
        registry
            .snapshot()
            .into_iter()
            .map(|record| Delivery::new(record.id, event.clone()))
            .collect()
    }

    #[test]
    fn test_broken_handles_are_isolated() {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone(), BroadcasterConfig::default());

        // 5 healthy clients, 3 broken ones interleaved.
        let mut healthy: Vec<(ClientId, OutboundReceiver)> = Vec::new();
        let mut broken = Vec::new();
        for i in 0..8 {
            let (handle, rx) = SendHandle::channel(8);
            let id = registry.register(handle);
            if i % 3 == 1 {
                drop(rx);
                broken.push(id);
            } else {
                healthy.push((id, rx));
            }
        }

        let report = broadcaster.deliver(broadcast_all(&registry, "hello"));

        assert_eq!(report.delivered, 5);
        assert_eq!(report.evicted_ids(), broken);
        for (id, rx) in &mut healthy {
            assert!(registry.contains(*id));
            assert_eq!(*rx.try_recv().unwrap(), Event::system("hello"));
        }
        for id in &broken {
            assert!(!registry.contains(*id));
        }
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_vanished_target_is_skipped() {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone(), BroadcasterConfig::default());

        let (handle, _rx) = SendHandle::channel(8);
        let id = registry.register(handle);
        let deliveries = vec![Delivery::new(id, event("late"))];
        registry.unregister(id);

        let report = broadcaster.deliver(deliveries);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 0);
        assert!(report.evicted.is_empty());
    }

    #[test]
    fn test_full_queue_strikes_then_evicts() {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster =
            Broadcaster::new(registry.clone(), BroadcasterConfig { max_strikes: 3 });

        let (slow, _slow_rx) = SendHandle::channel(1);
        let slow_id = registry.register(slow);
        let (fast, mut fast_rx) = SendHandle::channel(16);
        let fast_id = registry.register(fast);

        // First event fills the slow queue.
        broadcaster.deliver(broadcast_all(&registry, "0"));
        assert_eq!(broadcaster.strikes(slow_id), 0);

        let report = broadcaster.deliver(broadcast_all(&registry, "1"));
        assert_eq!(report.dropped, 1);
        assert_eq!(broadcaster.strikes(slow_id), 1);

        broadcaster.deliver(broadcast_all(&registry, "2"));
        let report = broadcaster.deliver(broadcast_all(&registry, "3"));
        assert_eq!(report.evicted_ids(), vec![slow_id]);
        assert!(!registry.contains(slow_id));
        assert!(registry.contains(fast_id));

        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[test]
    fn test_successful_send_resets_strikes() {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster =
            Broadcaster::new(registry.clone(), BroadcasterConfig { max_strikes: 2 });

        let (handle, mut rx) = SendHandle::channel(1);
        let id = registry.register(handle);

        broadcaster.deliver(vec![Delivery::new(id, event("a"))]);
        broadcaster.deliver(vec![Delivery::new(id, event("b"))]);
        assert_eq!(broadcaster.strikes(id), 1);

        // Consumer catches up.
        rx.try_recv().unwrap();
        broadcaster.deliver(vec![Delivery::new(id, event("c"))]);
        assert_eq!(broadcaster.strikes(id), 0);
        assert!(registry.contains(id));
    }

    #[test]
    fn test_evicted_target_later_in_batch_is_skipped() {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone(), BroadcasterConfig::default());

        let (handle, rx) = SendHandle::channel(8);
        let id = registry.register(handle);
        drop(rx);

        let report = broadcaster.deliver(vec![
            Delivery::new(id, event("a")),
            Delivery::new(id, event("b")),
        ]);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_departed_clients_leave_no_strikes_behind() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            BroadcasterConfig {
                max_strikes: u32::MAX,
            },
        ));
        let done = Arc::new(AtomicBool::new(false));

        let worker = {
            let registry = registry.clone();
            let broadcaster = broadcaster.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    broadcaster.deliver(broadcast_all(&registry, "x"));
                }
            })
        };

        // Full queues, so every delivery that finds them is a strike.
        for _ in 0..2000 {
            let (handle, rx) = SendHandle::channel(1);
            handle.try_deliver(event("fill")).unwrap();
            let id = registry.register(handle);
            std::thread::yield_now();
            registry.unregister(id);
            broadcaster.forget(id);
            drop(rx);
        }

        done.store(true, Ordering::Relaxed);
        worker.join().unwrap();
        assert!(registry.is_empty());
        assert_eq!(broadcaster.tracked(), 0);
    }
}
