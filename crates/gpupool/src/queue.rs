//! The pool work queue.
//!
//! Watches enqueue pool keys; workers drain them. A pending set coalesces
//! duplicate enqueues so a burst of events for one pool costs one
//! reconciliation, and a running set keeps per-pool reconciliations
//! serialized across workers: a key enqueued while its reconcile is in
//! flight is parked and handed back the moment the worker finishes.
//! A pool therefore occupies at most one queue slot at a time and
//! repeated enqueues never starve other pools.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::pool::PoolKey;

#[derive(Default)]
struct State {
    /// Sent into the channel, not yet picked up.
    pending: HashSet<PoolKey>,
    /// Picked up by a worker, reconcile in flight.
    running: HashSet<PoolKey>,
    /// Enqueued while running; re-queued on finish.
    dirty: HashSet<PoolKey>,
}

#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<PoolKey>,
    state: Arc<Mutex<State>>,
}

pub struct QueueReceiver {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PoolKey>>>,
    state: Arc<Mutex<State>>,
}

impl Clone for QueueReceiver {
    fn clone(&self) -> Self {
        QueueReceiver {
            rx: Arc::clone(&self.rx),
            state: Arc::clone(&self.state),
        }
    }
}

pub fn work_queue() -> (WorkQueue, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(State::default()));
    (
        WorkQueue {
            tx,
            state: Arc::clone(&state),
        },
        QueueReceiver {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            state,
        },
    )
}

impl WorkQueue {
    /// Enqueues a key. Coalesces with a waiting duplicate; defers when the
    /// key is being reconciled right now.
    pub fn enqueue(&self, key: PoolKey) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.running.contains(&key) {
                debug!(pool = %key, "reconcile in flight, parking enqueue");
                state.dirty.insert(key);
                return;
            }
            if !state.pending.insert(key.clone()) {
                debug!(pool = %key, "enqueue coalesced");
                return;
            }
        }
        // receiver never closes before the senders in this process
        let _ = self.tx.send(key);
    }

    /// Enqueues a key after a delay, for requeue hints and backoff.
    pub fn enqueue_after(&self, key: PoolKey, delay: std::time::Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Marks a reconcile as done. Anything that arrived for the key in the
    /// meantime goes around again.
    pub fn finish(&self, key: &PoolKey) {
        let rerun = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.running.remove(key);
            state.dirty.remove(key)
        };
        if rerun {
            self.enqueue(key.clone());
        }
    }
}

impl QueueReceiver {
    /// Hands out the next key and marks it running. Workers share one
    /// receiver; each key goes to exactly one worker, which must call
    /// [`WorkQueue::finish`] when the reconcile ends.
    pub async fn next(&self) -> Option<PoolKey> {
        let key = self.rx.lock().await.recv().await?;
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.pending.remove(&key);
        state.running.insert(key.clone());
        drop(state);
        Some(key)
    }
}
