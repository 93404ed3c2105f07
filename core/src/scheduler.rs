//! Background one-shot timers
//!
//! Each scheduled key owns at most one sleeping tokio task. When the delay
//! elapses the task posts a [`Fired`] message into the owner's dispatch
//! channel; it never touches owner state itself. Because a timer can fire
//! and be queued just before it is cancelled or rescheduled, the dispatcher
//! must [`Scheduler::claim`] every message before acting on it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::trace;

/// A timer expiry delivered to the dispatch context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired<K> {
    pub key: K,
    pub generation: u64,
}

struct Armed {
    generation: u64,
    abort: AbortHandle,
}

struct SchedulerState<K> {
    armed: HashMap<K, Armed>,
    next_generation: u64,
}

/// Keyed one-shot timer service running on a tokio runtime
pub struct Scheduler<K, M> {
    runtime: Handle,
    sink: UnboundedSender<M>,
    wrap: fn(Fired<K>) -> M,
    state: Mutex<SchedulerState<K>>,
}

impl<K, M> Scheduler<K, M>
where
    K: Hash + Eq + Clone + Debug + Send + 'static,
    M: Send + 'static,
{
    /// Create a scheduler whose expiries are delivered to `sink`, wrapped by `wrap`
    pub fn new(runtime: Handle, sink: UnboundedSender<M>, wrap: fn(Fired<K>) -> M) -> Self {
        Self {
            runtime,
            sink,
            wrap,
            state: Mutex::new(SchedulerState {
                armed: HashMap::new(),
                next_generation: 1,
            }),
        }
    }

    /// Arm (or re-arm) the timer for `key`. Any previous timer for the key is cancelled.
    pub fn schedule(&self, key: K, delay: Duration) -> u64 {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let sink = self.sink.clone();
        let wrap = self.wrap;
        let fired = Fired {
            key: key.clone(),
            generation,
        };
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // The dispatcher may already be gone; nothing left to notify
            let _ = sink.send(wrap(fired));
        });

        trace!("timer {:?} armed for {:?} (generation {})", key, delay, generation);
        if let Some(previous) = state.armed.insert(
            key,
            Armed {
                generation,
                abort: task.abort_handle(),
            },
        ) {
            previous.abort.abort();
        }
        generation
    }

    /// Cancel the timer for `key`. Returns true if one was armed.
    pub fn cancel(&self, key: &K) -> bool {
        match self.state.lock().armed.remove(key) {
            Some(armed) => {
                armed.abort.abort();
                trace!("timer {:?} cancelled", key);
                true
            }
            None => false,
        }
    }

    /// Cancel every armed timer
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        for (_, armed) in state.armed.drain() {
            armed.abort.abort();
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.state.lock().armed.contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        self.state.lock().armed.len()
    }

    /// Accept a fired timer if it is still the current one for its key.
    ///
    /// Consumes the armed entry on success. Stale expiries (cancelled or
    /// superseded after they were queued) return false and must be dropped.
    pub fn claim(&self, fired: &Fired<K>) -> bool {
        let mut state = self.state.lock();
        match state.armed.get(&fired.key) {
            Some(armed) if armed.generation == fired.generation => {
                state.armed.remove(&fired.key);
                true
            }
            _ => {
                trace!(
                    "timer {:?} generation {} is stale; dropping",
                    fired.key,
                    fired.generation
                );
                false
            }
        }
    }
}

impl<K, M> Drop for Scheduler<K, M> {
    fn drop(&mut self) {
        for (_, armed) in self.state.get_mut().armed.drain() {
            armed.abort.abort();
        }
    }
}
