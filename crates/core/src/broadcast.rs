//! Fan-out of progress snapshots to live observers.
//!
//! Every observer owns a bounded channel. Publishing never blocks: a full channel loses only this
//! tick's snapshot, a closed one is unregistered.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

use crate::progress::ProgressSnapshot;

pub type ObserverId = u64;
pub type SnapshotSender = Sender<Arc<ProgressSnapshot>>;

pub struct Subscription {
    pub id: ObserverId,
    pub receiver: Receiver<Arc<ProgressSnapshot>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

#[derive(Debug)]
struct BroadcasterState {
    current: Arc<ProgressSnapshot>,
    next_id: ObserverId,
    observers: BTreeMap<ObserverId, SnapshotSender>,
}

#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    inner: Arc<Mutex<BroadcasterState>>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcasterState {
                current: Arc::new(ProgressSnapshot::empty()),
                next_id: 1,
                observers: BTreeMap::new(),
            })),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BroadcasterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an observer and hands it the current snapshot right away.
    pub fn register(&self, sender: SnapshotSender) -> ObserverId {
        let mut state = self.lock_state();
        let id = state.next_id;
        state.next_id = state.next_id.saturating_add(1);

        match sender.try_send(Arc::clone(&state.current)) {
            Ok(()) | Err(TrySendError::Full(_)) => {
                state.observers.insert(id, sender);
                tracing::debug!(
                    event = "broadcast.register",
                    observer = id,
                    observers = state.observers.len(),
                    "observer registered"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
        id
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.register(sender);
        Subscription { id, receiver }
    }

    pub fn unregister(&self, id: ObserverId) {
        let mut state = self.lock_state();
        if state.observers.remove(&id).is_some() {
            tracing::debug!(
                event = "broadcast.unregister",
                observer = id,
                observers = state.observers.len(),
                "observer unregistered"
            );
        }
    }

    /// Replaces the current snapshot and offers it to every observer.
    pub fn publish(&self, snapshot: ProgressSnapshot) -> PublishReport {
        let snapshot = Arc::new(snapshot);
        let mut state = self.lock_state();
        state.current = Arc::clone(&snapshot);

        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        for (id, sender) in &state.observers {
            match sender.try_send(Arc::clone(&snapshot)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.dropped += 1,
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            state.observers.remove(&id);
            report.removed += 1;
            tracing::debug!(event = "broadcast.observer_gone", observer = id, "observer removed");
        }
        report
    }

    pub fn current(&self) -> Arc<ProgressSnapshot> {
        Arc::clone(&self.lock_state().current)
    }

    pub fn observer_count(&self) -> usize {
        self.lock_state().observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(peers: u32) -> ProgressSnapshot {
        ProgressSnapshot {
            peers,
            ..ProgressSnapshot::empty()
        }
    }

    #[test]
    fn register_yields_current_snapshot() {
        let b = ProgressBroadcaster::new();
        b.publish(snap(7));

        let mut sub = b.subscribe(4);
        let first = sub.receiver.try_recv().unwrap();
        assert_eq!(first.peers, 7);
    }

    #[test]
    fn broken_observer_does_not_affect_others() {
        let b = ProgressBroadcaster::new();
        let mut a = b.subscribe(4);
        let broken = b.subscribe(4);
        let mut c = b.subscribe(4);
        drop(broken.receiver);
        assert_eq!(b.observer_count(), 3);

        let report = b.publish(snap(3));
        assert_eq!(
            report,
            PublishReport {
                delivered: 2,
                dropped: 0,
                removed: 1
            }
        );
        assert_eq!(b.observer_count(), 2);

        for sub in [&mut a, &mut c] {
            let _initial = sub.receiver.try_recv().unwrap();
            assert_eq!(sub.receiver.try_recv().unwrap().peers, 3);
        }
    }

    #[test]
    fn full_observer_only_misses_a_tick() {
        let b = ProgressBroadcaster::new();
        let mut slow = b.subscribe(1);

        let report = b.publish(snap(1));
        assert_eq!(report.dropped, 1);
        assert_eq!(b.observer_count(), 1);

        let _initial = slow.receiver.try_recv().unwrap();
        b.publish(snap(2));
        assert_eq!(slow.receiver.try_recv().unwrap().peers, 2);
    }

    #[test]
    fn unregister_is_idempotent() {
        let b = ProgressBroadcaster::new();
        let sub = b.subscribe(1);
        b.unregister(sub.id);
        b.unregister(sub.id);
        assert_eq!(b.observer_count(), 0);
        assert_eq!(b.publish(snap(1)), PublishReport::default());
    }
}
