//! Mutation-safe listener collection
//!
//! Observers may attach or detach themselves (or each other) while an event is
//! being dispatched. Changes made during a traversal are buffered and applied
//! when the outermost traversal ends, so:
//!
//! - a listener attached during dispatch does not see the event in progress
//! - a listener detached during dispatch still sees the event in progress,
//!   but nothing after it

use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

struct ListenerState<T: ?Sized> {
    live: Vec<Arc<T>>,
    pending_add: Vec<Arc<T>>,
    pending_remove: Vec<Arc<T>>,
    traversals: usize,
}

impl<T: ?Sized> ListenerState<T> {
    fn position(list: &[Arc<T>], listener: &Arc<T>) -> Option<usize> {
        list.iter().position(|l| Arc::ptr_eq(l, listener))
    }

    /// Effective membership: live or pending-add, and not pending-remove
    fn is_member(&self, listener: &Arc<T>) -> bool {
        let present = Self::position(&self.live, listener).is_some()
            || Self::position(&self.pending_add, listener).is_some();
        present && Self::position(&self.pending_remove, listener).is_none()
    }

    fn apply_pending(&mut self) {
        for listener in self.pending_add.drain(..) {
            if Self::position(&self.live, &listener).is_none() {
                self.live.push(listener);
            }
        }
        for listener in self.pending_remove.drain(..) {
            if let Some(index) = Self::position(&self.live, &listener) {
                self.live.remove(index);
            }
        }
    }
}

/// Ordered set of listeners, identified by `Arc` pointer identity
pub struct ListenerSet<T: ?Sized> {
    name: String,
    state: Mutex<ListenerState<T>>,
}

impl<T: ?Sized> ListenerSet<T> {
    /// Create an empty listener set; `name` is only used in log output
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ListenerState {
                live: Vec::new(),
                pending_add: Vec::new(),
                pending_remove: Vec::new(),
                traversals: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a listener. Returns false if it is already attached.
    pub fn attach(&self, listener: Arc<T>) -> bool {
        let mut state = self.state.lock();
        if state.is_member(&listener) {
            return false;
        }
        if state.traversals > 0 {
            // Re-attaching something detached during this traversal cancels the detach
            if let Some(index) = ListenerState::position(&state.pending_remove, &listener) {
                state.pending_remove.remove(index);
                if ListenerState::position(&state.live, &listener).is_some() {
                    return true;
                }
            }
            state.pending_add.push(listener);
        } else {
            state.live.push(listener);
        }
        true
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn detach(&self, listener: &Arc<T>) -> bool {
        let mut state = self.state.lock();
        if !state.is_member(listener) {
            return false;
        }
        if state.traversals > 0 {
            if let Some(index) = ListenerState::position(&state.pending_add, listener) {
                state.pending_add.remove(index);
            } else {
                state.pending_remove.push(Arc::clone(listener));
            }
        } else if let Some(index) = ListenerState::position(&state.live, listener) {
            state.live.remove(index);
        }
        true
    }

    /// Detach every listener
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending_add.clear();
        if state.traversals > 0 {
            let live = state.live.clone();
            state.pending_remove = live;
        } else {
            state.live.clear();
            state.pending_remove.clear();
        }
    }

    pub fn contains(&self, listener: &Arc<T>) -> bool {
        self.state.lock().is_member(listener)
    }

    /// Number of listeners once any buffered changes are applied
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        let mut count = state.live.len() + state.pending_add.len();
        for removed in &state.pending_remove {
            if ListenerState::position(&state.live, removed).is_some() {
                count -= 1;
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a traversal over a snapshot of the live listeners.
    ///
    /// The lock is not held while the snapshot is iterated, so listeners may
    /// call back into this set. Dropping the guard ends the traversal.
    pub fn begin_traversal(&self) -> Traversal<'_, T> {
        let mut state = self.state.lock();
        state.traversals += 1;
        Traversal {
            owner: self,
            snapshot: state.live.clone(),
        }
    }

    fn end_traversal(&self) {
        let mut state = self.state.lock();
        state.traversals = state.traversals.saturating_sub(1);
        if state.traversals == 0 {
            state.apply_pending();
        }
    }
}

/// Snapshot of attached listeners for the duration of one dispatch
pub struct Traversal<'a, T: ?Sized> {
    owner: &'a ListenerSet<T>,
    snapshot: Vec<Arc<T>>,
}

impl<T: ?Sized> Deref for Traversal<'_, T> {
    type Target = [Arc<T>];

    fn deref(&self) -> &Self::Target {
        &self.snapshot
    }
}

impl<T: ?Sized> Drop for Traversal<'_, T> {
    fn drop(&mut self) {
        self.owner.end_traversal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Observer: Send + Sync {
        fn notify(&self, set: &ListenerSet<dyn Observer>);
    }

    struct Counter {
        hits: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl Observer for Counter {
        fn notify(&self, _set: &ListenerSet<dyn Observer>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dispatch(set: &ListenerSet<dyn Observer>) {
        let traversal = set.begin_traversal();
        for listener in traversal.iter() {
            listener.notify(set);
        }
    }

    #[test]
    fn test_attach_rejects_duplicates() {
        let set: ListenerSet<dyn Observer> = ListenerSet::new("test");
        let counter = Counter::new();
        let listener: Arc<dyn Observer> = counter.clone();

        assert!(set.attach(listener.clone()));
        assert!(!set.attach(listener.clone()));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&listener));
    }

    #[test]
    fn test_detach_unknown_listener() {
        let set: ListenerSet<dyn Observer> = ListenerSet::new("test");
        let listener: Arc<dyn Observer> = Counter::new();

        assert!(!set.detach(&listener));
        set.attach(listener.clone());
        assert!(set.detach(&listener));
        assert!(set.is_empty());
    }

    #[test]
    fn test_dispatch_in_attach_order() {
        struct Recorder {
            id: usize,
            log: Arc<Mutex<Vec<usize>>>,
        }
        impl Observer for Recorder {
            fn notify(&self, _set: &ListenerSet<dyn Observer>) {
                self.log.lock().push(self.id);
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let set: ListenerSet<dyn Observer> = ListenerSet::new("ordered");
        for id in 0..4 {
            set.attach(Arc::new(Recorder {
                id,
                log: log.clone(),
            }));
        }

        dispatch(&set);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    }

    struct SelfDetacher {
        hits: AtomicUsize,
        me: Mutex<Option<Arc<dyn Observer>>>,
    }

    impl Observer for SelfDetacher {
        fn notify(&self, set: &ListenerSet<dyn Observer>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = self.me.lock().take() {
                assert!(set.detach(&me));
            }
        }
    }

    #[test]
    fn test_listener_detached_during_dispatch_finishes_current_event() {
        let set: ListenerSet<dyn Observer> = ListenerSet::new("detach");
        let detacher = Arc::new(SelfDetacher {
            hits: AtomicUsize::new(0),
            me: Mutex::new(None),
        });
        let as_observer: Arc<dyn Observer> = detacher.clone();
        *detacher.me.lock() = Some(as_observer.clone());
        let trailing = Counter::new();

        set.attach(as_observer);
        set.attach(trailing.clone());

        dispatch(&set);
        assert_eq!(detacher.hits.load(Ordering::SeqCst), 1);
        assert_eq!(trailing.hits(), 1);
        assert_eq!(set.len(), 1);

        dispatch(&set);
        assert_eq!(detacher.hits.load(Ordering::SeqCst), 1);
        assert_eq!(trailing.hits(), 2);
    }

    struct Recruiter {
        recruit: Mutex<Option<Arc<dyn Observer>>>,
    }

    impl Observer for Recruiter {
        fn notify(&self, set: &ListenerSet<dyn Observer>) {
            if let Some(recruit) = self.recruit.lock().take() {
                assert!(set.attach(recruit));
            }
        }
    }

    #[test]
    fn test_listener_attached_during_dispatch_skips_current_event() {
        let set: ListenerSet<dyn Observer> = ListenerSet::new("attach");
        let late = Counter::new();
        set.attach(Arc::new(Recruiter {
            recruit: Mutex::new(Some(late.clone())),
        }));

        dispatch(&set);
        assert_eq!(late.hits(), 0);
        assert_eq!(set.len(), 2);

        dispatch(&set);
        assert_eq!(late.hits(), 1);
    }

    #[test]
    fn test_clear_during_traversal_is_deferred() {
        let set: ListenerSet<dyn Observer> = ListenerSet::new("clear");
        let a = Counter::new();
        let b = Counter::new();
        set.attach(a.clone());
        set.attach(b.clone());

        {
            let traversal = set.begin_traversal();
            set.clear();
            assert_eq!(traversal.len(), 2);
            for listener in traversal.iter() {
                listener.notify(&set);
            }
        }

        assert!(set.is_empty());
        dispatch(&set);
        assert_eq!(a.hits(), 1);
        assert_eq!(b.hits(), 1);
    }

    #[test]
    fn test_nested_traversals_apply_on_outermost_end() {
        let set: ListenerSet<dyn Observer> = ListenerSet::new("nested");
        let a: Arc<dyn Observer> = Counter::new();
        set.attach(a.clone());

        let outer = set.begin_traversal();
        {
            let _inner = set.begin_traversal();
            set.detach(&a);
        }
        assert_eq!(set.begin_traversal().len(), 1);
        drop(outer);
        assert_eq!(set.begin_traversal().len(), 0);
    }
}
