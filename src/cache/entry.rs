//! Per-key cache entries and the registry that owns them.

use super::types::ObserverId;
use crate::backend::CancelHandle;
use crate::error::{BackendError, CacheError, PermissionError};
use crate::types::{CacheKey, ObservedState, Operation};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) type Listener<D> = Box<dyn Fn(&ObservedState<D>) + Send + Sync>;

struct SlotState<D> {
    state: ObservedState<D>,
    /// Entry the slot is bound to; 0 when unbound.
    source: u64,
    /// Entry version of `state`.
    version: u64,
}

/// One consumer's view of a key: its latest state and optional listener.
pub(crate) struct ObserverSlot<D> {
    inner: Mutex<SlotState<D>>,
    listener: Option<Listener<D>>,
}

impl<D: Clone> ObserverSlot<D> {
    pub(crate) fn new(listener: Option<Listener<D>>) -> Self {
        Self {
            inner: Mutex::new(SlotState {
                state: ObservedState::idle(),
                source: 0,
                version: 0,
            }),
            listener,
        }
    }

    /// Bind to entry `source` at `version`, notifying the listener only
    /// when `notify` is set.
    fn bind(&self, source: u64, version: u64, state: ObservedState<D>, notify: bool) {
        {
            let mut inner = self.inner.lock();
            inner.source = source;
            inner.version = version;
            inner.state = state.clone();
        }
        if notify {
            self.notify(&state);
        }
    }

    /// Store an emission of entry `source`, then hand it to the listener.
    /// Emissions from another entry, or not newer than the current state,
    /// are dropped.
    fn deliver(&self, source: u64, version: u64, next: &ObservedState<D>) {
        {
            let mut inner = self.inner.lock();
            if inner.source != source || version <= inner.version {
                return;
            }
            inner.version = version;
            inner.state = next.clone();
        }
        self.notify(next);
    }

    fn notify(&self, state: &ObservedState<D>) {
        if let Some(listener) = &self.listener {
            listener(state);
        }
    }

    /// Unbind and replace the state without notifying.
    pub(crate) fn reset(&self, state: ObservedState<D>) {
        let mut inner = self.inner.lock();
        inner.source = 0;
        inner.version = 0;
        inner.state = state;
    }

    pub(crate) fn state(&self) -> ObservedState<D> {
        self.inner.lock().state.clone()
    }
}

pub(crate) struct EntryState<D> {
    observers: BTreeMap<ObserverId, Arc<ObserverSlot<D>>>,
    last_data: Option<D>,
    last_error: Option<CacheError>,
    is_loading: bool,
    /// Set once any snapshot arrived, including "document missing".
    has_result: bool,
    /// Bumped on every emission.
    version: u64,
    cancel: Option<CancelHandle>,
    /// Bumped whenever the observer set empties, so older teardown timers
    /// can tell they have been superseded.
    teardown_epoch: u64,
    evicted: bool,
}

/// Shared state for one key.
pub(crate) struct Entry<D> {
    id: u64,
    pub(crate) key: CacheKey,
    pub(crate) operation: Operation,
    pub(crate) registry: Weak<Registry<D>>,
    /// Held for a whole fan-out so emissions for this key never interleave.
    /// Re-entrant so listeners may call back into the cache.
    delivery: ReentrantMutex<()>,
    state: Mutex<EntryState<D>>,
}

impl<D: Clone> Entry<D> {
    fn new(id: u64, key: CacheKey, operation: Operation, registry: Weak<Registry<D>>) -> Self {
        Self {
            id,
            key,
            operation,
            registry,
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(EntryState {
                observers: BTreeMap::new(),
                last_data: None,
                last_error: None,
                is_loading: true,
                has_result: false,
                version: 0,
                cancel: None,
                teardown_epoch: 0,
                evicted: false,
            }),
        }
    }

    /// Add an observer and bring it up to date.
    ///
    /// A cached snapshot or error is replayed to the observer at once,
    /// marked stale. Returns false if the entry was evicted in the meantime.
    pub(crate) fn attach(&self, id: ObserverId, slot: &Arc<ObserverSlot<D>>) -> bool {
        let _turn = self.delivery.lock();

        let (version, replay) = {
            let mut state = self.state.lock();
            if state.evicted {
                return false;
            }
            state.observers.insert(id, Arc::clone(slot));

            let replay = (state.has_result || state.last_error.is_some()).then(|| ObservedState {
                data: state.last_data.clone(),
                is_loading: state.is_loading,
                error: state.last_error.clone(),
                is_stale: true,
            });
            (state.version, replay)
        };

        match replay {
            Some(cached) => slot.bind(self.id, version, cached, true),
            None => slot.bind(self.id, version, ObservedState::loading(), false),
        }
        true
    }

    /// Remove an observer. Returns the teardown epoch if the set is now empty.
    pub(crate) fn detach(&self, id: ObserverId) -> Option<u64> {
        let mut state = self.state.lock();
        if state.observers.remove(&id).is_none() || state.evicted {
            return None;
        }
        if state.observers.is_empty() {
            state.teardown_epoch += 1;
            Some(state.teardown_epoch)
        } else {
            None
        }
    }

    /// Attach the backend subscription handle. Cancels it straight away if
    /// the entry is already gone.
    pub(crate) fn install(&self, cancel: CancelHandle) {
        let mut state = self.state.lock();
        if state.evicted {
            drop(state);
            cancel.cancel();
        } else {
            state.cancel = Some(cancel);
        }
    }

    /// Record a successful snapshot and fan it out.
    pub(crate) fn apply(&self, data: Option<D>) {
        let _turn = self.delivery.lock();

        let (observers, version, next) = {
            let mut state = self.state.lock();
            if state.evicted {
                return;
            }
            state.last_data = data;
            state.last_error = None;
            state.is_loading = false;
            state.has_result = true;
            state.version += 1;

            let next = ObservedState {
                data: state.last_data.clone(),
                is_loading: false,
                error: None,
                is_stale: false,
            };
            (state.observers.values().cloned().collect::<Vec<_>>(), state.version, next)
        };

        for observer in observers {
            observer.deliver(self.id, version, &next);
        }
    }

    /// Record a backend failure and fan it out, keeping the last good data.
    pub(crate) fn fail(&self, error: BackendError, reporter: &Sender<PermissionError>) {
        let mapped = CacheError::from_backend(error, self.operation, &self.key);
        let _turn = self.delivery.lock();

        let (observers, version, next) = {
            let mut state = self.state.lock();
            if state.evicted {
                return;
            }
            state.last_error = Some(mapped.clone());
            state.is_loading = false;
            state.version += 1;

            let next = ObservedState {
                data: state.last_data.clone(),
                is_loading: false,
                error: Some(mapped.clone()),
                is_stale: false,
            };
            (state.observers.values().cloned().collect::<Vec<_>>(), state.version, next)
        };

        tracing::warn!(key = %self.key, error = %mapped, "subscription error");
        if let CacheError::Permission(permission) = mapped {
            if reporter.try_send(permission).is_err() {
                tracing::debug!(key = %self.key, "permission error report dropped");
            }
        }

        for observer in observers {
            observer.deliver(self.id, version, &next);
        }
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Evict if still idle and no newer detach has happened. Returns the
    /// backend handle to cancel, outside any lock.
    fn evict_if_idle(&self, epoch: u64) -> Option<Option<CancelHandle>> {
        let mut state = self.state.lock();
        if state.evicted || !state.observers.is_empty() || state.teardown_epoch != epoch {
            return None;
        }
        state.evicted = true;
        Some(state.cancel.take())
    }

    fn evict(&self) -> Option<CancelHandle> {
        let mut state = self.state.lock();
        state.evicted = true;
        state.cancel.take()
    }
}

/// All live entries of one kind (collections or documents).
pub(crate) struct Registry<D> {
    operation: Operation,
    next_entry: AtomicU64,
    entries: Mutex<HashMap<CacheKey, Arc<Entry<D>>>>,
}

impl<D: Clone> Registry<D> {
    pub(crate) fn new(operation: Operation) -> Self {
        Self {
            operation,
            next_entry: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the entry for `key`, creating it if needed. The flag is true
    /// when the caller created it and must start the backend subscription.
    pub(crate) fn get_or_create(self: &Arc<Self>, key: &CacheKey) -> (Arc<Entry<D>>, bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            return (Arc::clone(entry), false);
        }

        let id = self.next_entry.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(Entry::new(id, key.clone(), self.operation, Arc::downgrade(self)));
        entries.insert(key.clone(), Arc::clone(&entry));
        tracing::debug!(key = %key, operation = %self.operation, "cache entry created");
        (entry, true)
    }

    /// Remove `entry` if it is still the live entry for its key and has
    /// stayed idle since `epoch`. Returns the handle to cancel.
    pub(crate) fn evict_if_idle(&self, entry: &Arc<Entry<D>>, epoch: u64) -> Option<Option<CancelHandle>> {
        let mut entries = self.entries.lock();
        match entries.get(&entry.key) {
            Some(current) if Arc::ptr_eq(current, entry) => {}
            _ => return None,
        }

        let cancel = entry.evict_if_idle(epoch)?;
        entries.remove(&entry.key);
        Some(cancel)
    }

    /// Remove every entry, returning their backend handles.
    pub(crate) fn drain(&self) -> Vec<CancelHandle> {
        let entries: Vec<Arc<Entry<D>>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        entries.iter().filter_map(|entry| entry.evict()).collect()
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<Arc<Entry<D>>> {
        self.entries.lock().get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn observer_total(&self) -> usize {
        let entries: Vec<Arc<Entry<D>>> = self.entries.lock().values().cloned().collect();
        entries.iter().map(|entry| entry.observer_count()).sum()
    }
}
