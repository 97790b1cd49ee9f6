//! Asynchronous fan-out of leader-state changes.
//!
//! Listener callbacks may themselves submit operations to the state machine,
//! which would deadlock on the single-consumer apply thread. The notifier
//! therefore snapshots the listener set and runs callbacks on a separate
//! executor; only the snapshot happens on the apply thread.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::executor::TaskExecutor;

/// Observes this replica gaining or losing region leadership.
pub trait LeaderStateListener: Send + Sync {
    fn on_leader_start(&self, term: u64);

    /// `old_term` is the leader term field as it was before the stop:
    /// `-1` when this replica was never the leader.
    fn on_leader_stop(&self, old_term: i64);
}

type ListenerList = Arc<Vec<Arc<dyn LeaderStateListener>>>;

/// Copy-on-write listener set with executor-based fanout.
pub struct LeaderStateNotifier {
    listeners: RwLock<ListenerList>,
    executor: Arc<dyn TaskExecutor>,
}

impl LeaderStateNotifier {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        LeaderStateNotifier {
            listeners: RwLock::new(Arc::new(Vec::new())),
            executor,
        }
    }

    /// Register a listener. Writers clone the immutable list and swap it in;
    /// in-flight fanouts keep iterating their own snapshot.
    pub fn add_listener(&self, listener: Arc<dyn LeaderStateListener>) {
        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    fn snapshot(&self) -> ListenerList {
        self.listeners.read().clone()
    }

    pub fn notify_leader_start(&self, term: u64) {
        let listeners = self.snapshot();
        self.executor.execute(Box::new(move || {
            for listener in listeners.iter() {
                listener.on_leader_start(term);
            }
        }));
    }

    pub fn notify_leader_stop(&self, old_term: i64) {
        let listeners = self.snapshot();
        self.executor.execute(Box::new(move || {
            for listener in listeners.iter() {
                listener.on_leader_stop(old_term);
            }
        }));
    }
}
