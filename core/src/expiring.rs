//! Expiring keyed registry
//!
//! A key-ordered map from `u64` to `V` where every entry carries a TTL. A
//! background timer per entry posts an expiry into the registry's dispatch
//! task; listeners get a chance to keep the entry before it is removed.
//!
//! All public operations take one registry-wide lock. The lock is reentrant:
//! listeners run while it is held and may call back into the registry from
//! the same thread (e.g. `put` to refresh a TTL from `on_item_expiring`).

use crate::config::RegistryConfig;
use crate::listeners::ListenerSet;
use crate::scheduler::{Fired, Scheduler};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No tokio runtime available to run expiration timers")]
    NoRuntime,
    #[error("Index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("No current element; call next() first")]
    NoCurrentElement,
}

/// Answer from [`RegistryListener::on_item_expiring`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryDecision {
    /// Let the entry be removed
    Expire,
    /// Veto the removal and re-arm the entry's timer
    Keep,
}

/// Where a `put` landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New key inserted at this index
    Added(usize),
    /// Existing key updated in place at this index
    Updated(usize),
}

impl PutOutcome {
    pub fn index(&self) -> usize {
        match self {
            PutOutcome::Added(index) | PutOutcome::Updated(index) => *index,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, PutOutcome::Added(_))
    }
}

/// Observer of registry changes. Callbacks run with the registry lock held
/// and should stay side-effect-light.
#[allow(unused_variables)]
pub trait RegistryListener<V>: Send + Sync {
    fn on_item_added(&self, key: u64, index: usize, value: &V) {}

    fn on_item_updated(&self, key: u64, index: usize, value: &V) {}

    fn on_item_expiring(&self, key: u64, index: usize, value: &V, ttl: Duration) -> ExpiryDecision {
        ExpiryDecision::Expire
    }

    fn on_item_removed(&self, key: u64, index: usize, value: &V, ttl: Duration, expired: bool) {}
}

/// Timing snapshot of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: u64,
    pub ttl: Duration,
    /// Time since the key was first inserted
    pub age: Duration,
    /// Time left before expiry; `None` when expiry is disabled
    pub remaining: Option<Duration>,
}

struct Entry<V> {
    key: u64,
    value: V,
    inserted_at: Instant,
    written_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn expires(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// `ttl - (now - last write)`, floored at zero
    fn remaining(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.written_at))
    }

    fn info(&self, now: Instant) -> EntryInfo {
        EntryInfo {
            key: self.key,
            ttl: self.ttl,
            age: now.saturating_duration_since(self.inserted_at),
            remaining: self.expires().then(|| self.remaining(now)),
        }
    }
}

struct RegistryState<V> {
    entries: Vec<Entry<V>>,
    default_ttl: Duration,
    started: bool,
}

impl<V> RegistryState<V> {
    fn search(&self, key: u64) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&key, |entry| entry.key)
    }
}

type ExpiryScheduler = Scheduler<u64, Fired<u64>>;
type StateGuard<'a, V> = ReentrantMutexGuard<'a, RefCell<RegistryState<V>>>;

struct RegistryInner<V> {
    name: String,
    state: ReentrantMutex<RefCell<RegistryState<V>>>,
    listeners: ListenerSet<dyn RegistryListener<V>>,
    scheduler: ExpiryScheduler,
}

/// Sorted `u64`-keyed map with per-entry TTL and background expiry
pub struct ExpiringRegistry<V> {
    inner: Arc<RegistryInner<V>>,
}

impl<V> Clone for ExpiringRegistry<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + 'static> ExpiringRegistry<V> {
    /// Create a registry. Must be called from within a tokio runtime, which
    /// hosts the expiration timers and the dispatch task.
    pub fn new(name: impl Into<String>, default_ttl: Duration) -> Result<Self, RegistryError> {
        let runtime = Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        let name = name.into();
        let (expiry_tx, mut expiry_rx) = mpsc::unbounded_channel::<Fired<u64>>();

        let inner = Arc::new(RegistryInner {
            listeners: ListenerSet::new(format!("{}.listeners", name)),
            state: ReentrantMutex::new(RefCell::new(RegistryState {
                entries: Vec::new(),
                default_ttl,
                started: false,
            })),
            scheduler: Scheduler::new(runtime.clone(), expiry_tx, |fired| fired),
            name,
        });

        // Dispatch context: every expiry is handled here, one at a time
        let weak: Weak<RegistryInner<V>> = Arc::downgrade(&inner);
        runtime.spawn(async move {
            while let Some(fired) = expiry_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.expire(fired);
            }
        });

        Ok(Self { inner })
    }

    pub fn from_config(name: impl Into<String>, config: &RegistryConfig) -> Result<Self, RegistryError> {
        Self::new(name, config.default_ttl())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener<V>>) -> bool {
        self.inner.listeners.attach(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RegistryListener<V>>) -> bool {
        self.inner.listeners.detach(listener)
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.state.lock().borrow().default_ttl
    }

    /// Change the TTL used by `put`; armed timers are re-armed
    pub fn set_default_ttl(&self, ttl: Duration) {
        let guard = self.inner.state.lock();
        self.pause();
        guard.borrow_mut().default_ttl = ttl;
        self.resume();
    }

    /// Insert or update `key` with the default TTL
    pub fn put(&self, key: u64, value: V) -> PutOutcome {
        let ttl = self.default_ttl();
        self.put_with_ttl(key, value, ttl)
    }

    /// Insert or update `key`. A zero `ttl` disables expiry for the entry.
    pub fn put_with_ttl(&self, key: u64, value: V, ttl: Duration) -> PutOutcome {
        let guard = self.inner.state.lock();
        let outcome = {
            let mut state = guard.borrow_mut();
            let now = Instant::now();
            match state.search(key) {
                Ok(index) => {
                    let entry = &mut state.entries[index];
                    entry.value = value;
                    entry.ttl = ttl;
                    entry.written_at = now;
                    PutOutcome::Updated(index)
                }
                Err(index) => {
                    state.entries.insert(
                        index,
                        Entry {
                            key,
                            value,
                            inserted_at: now,
                            written_at: now,
                            ttl,
                        },
                    );
                    PutOutcome::Added(index)
                }
            }
        };
        trace!("#{} put key={} ttl={:?} -> {:?}", self.inner.name, key, ttl, outcome);
        self.inner.on_item_written(&guard, outcome);
        outcome
    }

    /// Replace the value at `index` under the default TTL
    pub fn set_value_at(&self, index: usize, value: V) -> Result<(), RegistryError> {
        let ttl = self.default_ttl();
        self.set_value_at_with_ttl(index, value, ttl)
    }

    /// Replace the value at `index`, resetting its TTL
    pub fn set_value_at_with_ttl(
        &self,
        index: usize,
        value: V,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        let guard = self.inner.state.lock();
        {
            let mut state = guard.borrow_mut();
            let len = state.entries.len();
            let entry = state
                .entries
                .get_mut(index)
                .ok_or(RegistryError::IndexOutOfBounds { index, len })?;
            entry.value = value;
            entry.ttl = ttl;
            entry.written_at = Instant::now();
        }
        self.inner.on_item_written(&guard, PutOutcome::Updated(index));
        Ok(())
    }

    pub fn get(&self, key: u64) -> Option<V> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state
            .search(key)
            .ok()
            .map(|index| state.entries[index].value.clone())
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.index_of_key(key).is_some()
    }

    /// Timing details for `key`
    pub fn entry_info(&self, key: u64) -> Option<EntryInfo> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        let now = Instant::now();
        state
            .search(key)
            .ok()
            .map(|index| state.entries[index].info(now))
    }

    /// Time left before `key` expires; `None` if absent or non-expiring
    pub fn remaining(&self, key: u64) -> Option<Duration> {
        self.entry_info(key).and_then(|info| info.remaining)
    }

    pub fn remove(&self, key: u64) -> Option<V> {
        let guard = self.inner.state.lock();
        let index = guard.borrow().search(key).ok()?;
        Some(self.inner.remove_at_locked(&guard, index, false))
    }

    pub fn remove_at(&self, index: usize) -> Result<V, RegistryError> {
        let guard = self.inner.state.lock();
        let len = guard.borrow().entries.len();
        if index >= len {
            return Err(RegistryError::IndexOutOfBounds { index, len });
        }
        Ok(self.inner.remove_at_locked(&guard, index, false))
    }

    /// Remove every entry, firing `on_item_removed` for each
    pub fn clear(&self) {
        let guard = self.inner.state.lock();
        while !guard.borrow().entries.is_empty() {
            self.inner.remove_at_locked(&guard, 0, false);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_at(&self, index: usize) -> Option<u64> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.entries.get(index).map(|entry| entry.key)
    }

    pub fn value_at(&self, index: usize) -> Option<V> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.entries.get(index).map(|entry| entry.value.clone())
    }

    pub fn index_of_key(&self, key: u64) -> Option<usize> {
        self.inner.state.lock().borrow().search(key).ok()
    }

    /// Snapshot of the keys in ascending order
    pub fn keys(&self) -> Vec<u64> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.entries.iter().map(|entry| entry.key).collect()
    }

    /// Cursor over the values in key order that can remove the current element
    pub fn values(&self) -> ValuesCursor<'_, V> {
        ValuesCursor {
            registry: self,
            index: 0,
            can_remove: false,
        }
    }

    /// Whether expiration scheduling is active
    pub fn is_started(&self) -> bool {
        self.inner.state.lock().borrow().started
    }

    /// Cancel all scheduled expirations; entries stay and `resume` re-arms them
    pub fn pause(&self) {
        let guard = self.inner.state.lock();
        if guard.borrow().started {
            self.inner.scheduler.cancel_all();
        }
    }

    pub fn resume(&self) {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        if state.started {
            let now = Instant::now();
            for entry in &state.entries {
                self.inner.arm(entry, now);
            }
        }
    }

    /// Cancel all expirations and leave the started state until the next write
    pub fn stop(&self) {
        let guard = self.inner.state.lock();
        self.inner.scheduler.cancel_all();
        guard.borrow_mut().started = false;
    }
}

impl<V: Clone + Send + PartialEq + 'static> ExpiringRegistry<V> {
    pub fn index_of_value(&self, value: &V) -> Option<usize> {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.entries.iter().position(|entry| &entry.value == value)
    }
}

impl<V: Clone + Send + 'static> RegistryInner<V> {
    /// Arm (or disarm) the timer for one entry from its remaining TTL
    fn arm(&self, entry: &Entry<V>, now: Instant) {
        if entry.expires() {
            self.scheduler.schedule(entry.key, entry.remaining(now));
        } else {
            self.scheduler.cancel(&entry.key);
        }
    }

    fn on_item_written(&self, guard: &StateGuard<'_, V>, outcome: PutOutcome) {
        let index = outcome.index();
        let (key, value) = {
            let mut state = guard.borrow_mut();
            let now = Instant::now();
            if state.started {
                self.arm(&state.entries[index], now);
            } else {
                state.started = true;
                for entry in &state.entries {
                    self.arm(entry, now);
                }
            }
            let entry = &state.entries[index];
            (entry.key, entry.value.clone())
        };

        let traversal = self.listeners.begin_traversal();
        for listener in traversal.iter() {
            match outcome {
                PutOutcome::Added(_) => listener.on_item_added(key, index, &value),
                PutOutcome::Updated(_) => listener.on_item_updated(key, index, &value),
            }
        }
    }

    fn remove_at_locked(&self, guard: &StateGuard<'_, V>, index: usize, expired: bool) -> V {
        let entry = {
            let mut state = guard.borrow_mut();
            let entry = state.entries.remove(index);
            self.scheduler.cancel(&entry.key);
            if state.started && state.entries.is_empty() {
                debug!("#{} empty; stopping expiration", self.name);
                self.scheduler.cancel_all();
                state.started = false;
            }
            entry
        };

        let traversal = self.listeners.begin_traversal();
        for listener in traversal.iter() {
            listener.on_item_removed(entry.key, index, &entry.value, entry.ttl, expired);
        }
        drop(traversal);

        entry.value
    }

    fn expire(&self, fired: Fired<u64>) {
        let guard = self.state.lock();
        if !self.scheduler.claim(&fired) {
            return;
        }
        let key = fired.key;

        let (index, value, ttl) = {
            let state = guard.borrow();
            match state.search(key) {
                Ok(index) => {
                    let entry = &state.entries[index];
                    (index, entry.value.clone(), entry.ttl)
                }
                Err(_) => {
                    trace!("#{} expire: key={} already removed", self.name, key);
                    return;
                }
            }
        };

        let mut keep = false;
        {
            let traversal = self.listeners.begin_traversal();
            for listener in traversal.iter() {
                if listener.on_item_expiring(key, index, &value, ttl) == ExpiryDecision::Keep {
                    keep = true;
                    break;
                }
            }
        }

        // Listeners may have rewritten or removed the entry; look it up again
        let current = guard.borrow().search(key).ok();
        let Some(index) = current else {
            return;
        };

        if keep {
            debug!("#{} expire: key={} kept by listener", self.name, key);
            if !self.scheduler.is_scheduled(&key) {
                let mut state = guard.borrow_mut();
                let now = Instant::now();
                let entry = &mut state.entries[index];
                if entry.remaining(now).is_zero() {
                    entry.written_at = now;
                }
                self.arm(entry, now);
            }
            return;
        }

        if self.scheduler.is_scheduled(&key) {
            // A listener refreshed the entry without vetoing; its new timer wins
            return;
        }

        warn!("#{} expired after {:?}: key={} index={}", self.name, ttl, key, index);
        self.remove_at_locked(&guard, index, true);
    }
}

/// Value iterator that supports removing the element last returned
pub struct ValuesCursor<'a, V> {
    registry: &'a ExpiringRegistry<V>,
    index: usize,
    can_remove: bool,
}

impl<V: Clone + Send + 'static> ValuesCursor<'_, V> {
    /// Remove the element most recently returned by `next`
    pub fn remove_current(&mut self) -> Result<V, RegistryError> {
        if !self.can_remove {
            return Err(RegistryError::NoCurrentElement);
        }
        self.can_remove = false;
        self.index -= 1;
        self.registry.remove_at(self.index)
    }
}

impl<V: Clone + Send + 'static> Iterator for ValuesCursor<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let value = self.registry.value_at(self.index)?;
        self.index += 1;
        self.can_remove = true;
        Some(value)
    }
}
