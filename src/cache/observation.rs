//! Handles held by cache consumers.

use super::entry::{Entry, ObserverSlot};
use super::manager::Shared;
use super::types::ObserverId;
use crate::error::CacheError;
use crate::query::{DocumentRef, Query};
use crate::types::{CacheKey, CollectionData, DocumentData, ObservedState};
use std::sync::Arc;

/// Link between an observer and the entry it is attached to.
pub(crate) struct Binding<D> {
    pub(crate) entry: Arc<Entry<D>>,
    pub(crate) id: ObserverId,
}

/// One consumer's live view of a query or document.
///
/// The observer stays attached until the handle is dropped or
/// [`unsubscribe`](Self::unsubscribe)d.
pub struct Observation<D: Clone + Send + Sync + 'static> {
    shared: Arc<Shared>,
    slot: Arc<ObserverSlot<D>>,
    binding: Option<Binding<D>>,
    warned_unstable: bool,
}

impl<D: Clone + Send + Sync + 'static> Observation<D> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        slot: Arc<ObserverSlot<D>>,
        binding: Option<Binding<D>>,
    ) -> Self {
        Self {
            shared,
            slot,
            binding,
            warned_unstable: false,
        }
    }

    /// Latest state delivered to this observer.
    pub fn state(&self) -> ObservedState<D> {
        self.slot.state()
    }

    pub fn data(&self) -> Option<D> {
        self.slot.state().data
    }

    pub fn error(&self) -> Option<CacheError> {
        self.slot.state().error
    }

    pub fn is_loading(&self) -> bool {
        self.slot.state().is_loading
    }

    pub fn is_stale(&self) -> bool {
        self.slot.state().is_stale
    }

    /// Key of the entry this observer is attached to.
    pub fn key(&self) -> Option<&CacheKey> {
        self.binding.as_ref().map(|b| &b.entry.key)
    }

    pub fn id(&self) -> Option<ObserverId> {
        self.binding.as_ref().map(|b| b.id)
    }

    /// Detach now rather than on drop.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(binding) = self.binding.take() {
            self.shared.release(binding);
        }
    }

    /// Handle a rebind whose key equals the current one. Returns true if
    /// nothing else needs doing.
    fn same_key(&mut self, key: Option<&CacheKey>) -> bool {
        if key != self.key() {
            return false;
        }
        if let Some(key) = key {
            if !self.warned_unstable {
                self.warned_unstable = true;
                tracing::warn!(
                    key = %key,
                    "observation rebound to a rebuilt query with an identical key; keep the query stable"
                );
            }
        }
        true
    }
}

impl Observation<CollectionData> {
    /// Point this observation at another query.
    ///
    /// A query with the same key keeps the current subscription. A new key
    /// moves the observer; `None` detaches it and resets to idle.
    pub fn rebind(&mut self, query: Option<&Query>) {
        let key = query.map(|q| self.shared.backend.collection_key(q));
        if self.same_key(key.as_ref()) {
            return;
        }

        self.detach();
        self.binding = match (query, key) {
            (Some(query), Some(key)) => Some(self.shared.bind_collection(query, key, &self.slot)),
            _ => {
                self.slot.reset(ObservedState::idle());
                None
            }
        };
    }
}

impl Observation<DocumentData> {
    /// Point this observation at another document. Same rules as the
    /// collection variant.
    pub fn rebind(&mut self, doc: Option<&DocumentRef>) {
        let key = doc.map(|d| self.shared.backend.document_key(d));
        if self.same_key(key.as_ref()) {
            return;
        }

        self.detach();
        self.binding = match (doc, key) {
            (Some(doc), Some(key)) => Some(self.shared.bind_document(doc, key, &self.slot)),
            _ => {
                self.slot.reset(ObservedState::idle());
                None
            }
        };
    }
}

impl<D: Clone + Send + Sync + 'static> Drop for Observation<D> {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::MemoryBackend;
    use crate::cache::{CacheConfig, SubscriptionCache};
    use crate::query::Query;
    use crate::scheduler::ManualScheduler;
    use crate::types::ObservedState;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryBackend>, SubscriptionCache) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = SubscriptionCache::with_scheduler(
            backend.clone(),
            CacheConfig::default().immediate_teardown(),
            Arc::new(ManualScheduler::new()),
        );
        (backend, cache)
    }

    #[test]
    fn test_null_observation_is_idle() {
        let (backend, cache) = setup();
        let observation = cache.observe_collection(None);

        assert_eq!(observation.state(), ObservedState::idle());
        assert!(observation.key().is_none());
        assert_eq!(backend.subscribe_calls(), 0);
        assert_eq!(cache.stats().collections, 0);
    }

    #[test]
    fn test_rebind_same_key_keeps_subscription() {
        let (backend, cache) = setup();
        let mut observation = cache.observe_collection(Some(&Query::collection("clients").unwrap()));

        let rebuilt = Query::collection("clients").unwrap();
        observation.rebind(Some(&rebuilt));
        observation.rebind(Some(&rebuilt));

        assert_eq!(backend.subscribe_calls(), 1);
        assert_eq!(backend.cancel_calls(), 0);
    }

    #[test]
    fn test_rebind_new_key_moves_observer() {
        let (backend, cache) = setup();
        backend.set("clients/1", json!({"name": "Acme"})).unwrap();
        let mut observation = cache.observe_collection(Some(&Query::collection("clients").unwrap()));
        assert_eq!(observation.data().unwrap().len(), 1);

        observation.rebind(Some(&Query::collection("staff").unwrap()));

        assert_eq!(observation.key().unwrap().as_str(), "staff");
        assert_eq!(observation.data().unwrap().len(), 0);
        assert_eq!(backend.subscribe_calls(), 2);
        // Immediate teardown released the old key.
        assert_eq!(backend.cancel_calls(), 1);
    }

    #[test]
    fn test_rebind_to_none_resets_to_idle() {
        let (backend, cache) = setup();
        let mut observation = cache.observe_document(Some(&Query::collection("clients").unwrap().doc("1").unwrap()));

        observation.rebind(None);

        assert_eq!(observation.state(), ObservedState::idle());
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let (_backend, cache) = setup();
        let query = Query::collection("hearings").unwrap();
        let observation = cache.observe_collection(Some(&query));
        assert_eq!(cache.observer_count(&query.cache_key()), 1);

        observation.unsubscribe();
        assert!(!cache.contains(&query.cache_key()));
    }
}
